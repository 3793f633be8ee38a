/// Unrooted bifurcating tree with an explicit edge table
///
/// Leaves are nodes `0..n_taxa` (leaf `i` carries taxon `i`), internal nodes
/// follow. Every edge `e` gives two directed branches: `2e` points from
/// `edge.a` to `edge.b`, `2e + 1` the other way. A directed branch `p -> q`
/// names the subtree on `q`'s side, which is what partial likelihoods cache.

use crate::error::{PhyloError, Result};

pub type NodeId = usize;
pub type EdgeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub usize);

impl BranchId {
    #[inline]
    pub fn new(edge: EdgeId, reversed: bool) -> Self {
        BranchId(2 * edge + usize::from(reversed))
    }

    #[inline]
    pub fn edge(self) -> EdgeId {
        self.0 / 2
    }

    #[inline]
    pub fn reverse(self) -> BranchId {
        BranchId(self.0 ^ 1)
    }
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub a: NodeId,
    pub b: NodeId,
    pub length: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub node: NodeId,
    pub edge: EdgeId,
}

#[derive(Clone, Debug)]
pub struct Tree {
    taxa: Vec<String>,
    adjacency: Vec<Vec<Neighbor>>,
    edges: Vec<Edge>,
}

/// Rooted intermediate form shared by the Newick and structure builders
struct RootedShape {
    children: Vec<Vec<usize>>,
    lengths: Vec<f64>,
    taxon: Vec<Option<usize>>,
    root: usize,
}

impl Tree {
    /// Build from an explicit edge list; nodes `0..taxa.len()` must be the leaves
    pub fn from_edges(taxa: Vec<String>, n_nodes: usize, edges: Vec<(NodeId, NodeId, f64)>) -> Result<Self> {
        let n_taxa = taxa.len();
        if n_taxa < 2 {
            return Err(PhyloError::malformed("a tree needs at least two taxa"));
        }
        let expected_nodes = if n_taxa == 2 { 2 } else { 2 * n_taxa - 2 };
        if n_nodes != expected_nodes || edges.len() != n_nodes - 1 {
            return Err(PhyloError::malformed(format!(
                "an unrooted bifurcating tree on {} taxa has {} nodes and {} edges, got {} and {}",
                n_taxa,
                expected_nodes,
                expected_nodes - 1,
                n_nodes,
                edges.len()
            )));
        }

        let mut adjacency = vec![Vec::with_capacity(3); n_nodes];
        let mut table = Vec::with_capacity(edges.len());
        for (id, &(a, b, length)) in edges.iter().enumerate() {
            if a >= n_nodes || b >= n_nodes || a == b {
                return Err(PhyloError::malformed(format!("invalid edge ({a}, {b})")));
            }
            if !(length >= 0.0) || !length.is_finite() {
                return Err(PhyloError::malformed(format!(
                    "edge ({a}, {b}) has invalid length {length}"
                )));
            }
            adjacency[a].push(Neighbor { node: b, edge: id });
            adjacency[b].push(Neighbor { node: a, edge: id });
            table.push(Edge { a, b, length });
        }

        for (node, neighbors) in adjacency.iter().enumerate() {
            let expected = if node < n_taxa { 1 } else { 3 };
            if neighbors.len() != expected {
                let kind = if node < n_taxa { "leaf" } else { "internal node" };
                return Err(PhyloError::malformed(format!(
                    "{kind} {node} has degree {}, expected {expected}",
                    neighbors.len()
                )));
            }
        }

        let tree = Self {
            taxa,
            adjacency,
            edges: table,
        };
        if tree.reachable_from(0) != n_nodes {
            return Err(PhyloError::malformed("tree is not connected"));
        }
        Ok(tree)
    }

    /// Parse Newick; leaf labels must be exactly `taxa`. A bifurcating root is
    /// suppressed by merging its two edges.
    pub fn from_newick(newick: &str, taxa: &[String]) -> Result<Self> {
        let shape = NewickParser::new(newick).parse(taxa)?;
        Self::from_rooted(taxa.to_vec(), shape)
    }

    /// Build from (node_id, parent_id) pairs with per-node lengths to the parent
    ///
    /// `leaf_node_ids[i]` is the node carrying `leaf_names[i]`.
    pub fn from_structure(
        structure: Vec<(usize, Option<usize>)>,
        branch_lengths: Vec<f64>,
        leaf_names: Vec<String>,
        leaf_node_ids: Vec<usize>,
    ) -> Result<Self> {
        let n_nodes = structure.len();
        if branch_lengths.len() != n_nodes || leaf_names.len() != leaf_node_ids.len() {
            return Err(PhyloError::malformed(
                "structure, branch_lengths and leaf lists have inconsistent sizes",
            ));
        }

        let mut children = vec![Vec::new(); n_nodes];
        let mut root = None;
        for &(node, parent) in &structure {
            if node >= n_nodes || parent.is_some_and(|p| p >= n_nodes) {
                return Err(PhyloError::malformed(format!("node id {node} out of range")));
            }
            match parent {
                Some(p) => children[p].push(node),
                None if root.is_none() => root = Some(node),
                None => return Err(PhyloError::malformed("more than one root")),
            }
        }
        let root = root.ok_or_else(|| PhyloError::malformed("No root node found"))?;

        let mut taxon = vec![None; n_nodes];
        for (i, &node) in leaf_node_ids.iter().enumerate() {
            if node >= n_nodes || !children[node].is_empty() {
                return Err(PhyloError::malformed(format!("leaf id {node} is not a tip")));
            }
            taxon[node] = Some(i);
        }

        let shape = RootedShape {
            children,
            lengths: branch_lengths,
            taxon,
            root,
        };
        Self::from_rooted(leaf_names, shape)
    }

    fn from_rooted(taxa: Vec<String>, shape: RootedShape) -> Result<Self> {
        let n_taxa = taxa.len();
        let n_shape = shape.children.len();
        let root_children = &shape.children[shape.root];
        let suppress_root = root_children.len() == 2;
        if root_children.len() < 2 {
            return Err(PhyloError::malformed("root must have at least two children"));
        }

        // Leaves first, then internal nodes in shape order
        let mut ids = vec![usize::MAX; n_shape];
        let mut next_internal = n_taxa;
        for node in 0..n_shape {
            if suppress_root && node == shape.root {
                continue;
            }
            match shape.taxon[node] {
                Some(t) => ids[node] = t,
                None if shape.children[node].is_empty() => {
                    return Err(PhyloError::malformed(format!("tip {node} has no taxon")));
                }
                None => {
                    ids[node] = next_internal;
                    next_internal += 1;
                }
            }
        }

        let mut edges = Vec::with_capacity(n_shape);
        for parent in 0..n_shape {
            if suppress_root && parent == shape.root {
                continue;
            }
            for &child in &shape.children[parent] {
                edges.push((ids[parent], ids[child], shape.lengths[child]));
            }
        }
        if suppress_root {
            let (c1, c2) = (root_children[0], root_children[1]);
            edges.push((ids[c1], ids[c2], shape.lengths[c1] + shape.lengths[c2]));
        }

        Self::from_edges(taxa, next_internal, edges)
    }

    fn reachable_from(&self, start: NodeId) -> usize {
        let mut seen = vec![false; self.adjacency.len()];
        let mut stack = vec![start];
        seen[start] = true;
        let mut count = 0;
        while let Some(node) = stack.pop() {
            count += 1;
            for nb in &self.adjacency[node] {
                if !seen[nb.node] {
                    seen[nb.node] = true;
                    stack.push(nb.node);
                }
            }
        }
        count
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn n_taxa(&self) -> usize {
        self.taxa.len()
    }

    pub fn n_nodes(&self) -> usize {
        self.adjacency.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        node < self.taxa.len()
    }

    #[inline]
    pub fn neighbors(&self, node: NodeId) -> &[Neighbor] {
        &self.adjacency[node]
    }

    #[inline]
    pub fn edge(&self, edge: EdgeId) -> &Edge {
        &self.edges[edge]
    }

    #[inline]
    pub fn branch_length(&self, edge: EdgeId) -> f64 {
        self.edges[edge].length
    }

    pub fn set_branch_length(&mut self, edge: EdgeId, length: f64) {
        self.edges[edge].length = length;
    }

    pub fn branch_lengths(&self) -> Vec<f64> {
        self.edges.iter().map(|e| e.length).collect()
    }

    pub fn set_branch_lengths(&mut self, lengths: &[f64]) {
        for (edge, &length) in self.edges.iter_mut().zip(lengths) {
            edge.length = length;
        }
    }

    pub fn scale_lengths(&mut self, factor: f64) {
        for edge in &mut self.edges {
            edge.length *= factor;
        }
    }

    pub fn total_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum()
    }

    /// Edge joining two adjacent nodes
    #[inline]
    pub fn edge_between(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        self.adjacency
            .get(a)?
            .iter()
            .find(|nb| nb.node == b)
            .map(|nb| nb.edge)
    }

    /// Directed branch `from -> to`
    #[inline]
    pub fn branch(&self, from: NodeId, to: NodeId) -> Option<BranchId> {
        let edge = self.edge_between(from, to)?;
        Some(BranchId::new(edge, self.edges[edge].a != from))
    }

    #[inline]
    pub fn branch_source(&self, branch: BranchId) -> NodeId {
        let edge = &self.edges[branch.edge()];
        if branch.0 % 2 == 0 {
            edge.a
        } else {
            edge.b
        }
    }

    #[inline]
    pub fn branch_target(&self, branch: BranchId) -> NodeId {
        self.branch_source(branch.reverse())
    }

    /// Branches leaving the target of `branch`, away from its source
    pub fn child_branches(&self, branch: BranchId) -> impl Iterator<Item = BranchId> + '_ {
        let from = self.branch_source(branch);
        let node = self.branch_target(branch);
        self.adjacency[node]
            .iter()
            .filter(move |nb| nb.node != from)
            .map(move |nb| BranchId::new(nb.edge, self.edges[nb.edge].a != node))
    }

    /// Edge used when the caller does not name one: the pendant edge of taxon 0
    pub fn default_edge(&self) -> EdgeId {
        self.adjacency[0][0].edge
    }

    /// Every edge, children before the edge above them, in a depth-first walk from leaf 0
    pub fn edges_postorder(&self) -> Vec<EdgeId> {
        let mut order = Vec::with_capacity(self.edges.len());
        // (node, parent, edge to parent, children pushed)
        let mut stack = vec![(0, usize::MAX, usize::MAX, false)];
        while let Some((node, parent, up_edge, expanded)) = stack.pop() {
            if expanded {
                if up_edge != usize::MAX {
                    order.push(up_edge);
                }
                continue;
            }
            stack.push((node, parent, up_edge, true));
            for nb in self.adjacency[node].iter().rev() {
                if nb.node != parent {
                    stack.push((nb.node, node, nb.edge, false));
                }
            }
        }
        order
    }

    pub fn to_newick(&self) -> String {
        let start = if self.n_nodes() > 2 { self.taxa.len() } else { 0 };
        let mut out = String::new();
        self.write_newick(start, usize::MAX, &mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, node: NodeId, parent: NodeId, out: &mut String) {
        let children: Vec<&Neighbor> = self.adjacency[node].iter().filter(|nb| nb.node != parent).collect();
        if !children.is_empty() {
            out.push('(');
            if self.is_leaf(node) {
                out.push_str(&self.taxa[node]);
                out.push(',');
            }
            for (i, nb) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_newick(nb.node, node, out);
                out.push_str(&format!(":{}", self.edges[nb.edge].length));
            }
            out.push(')');
        } else if self.is_leaf(node) {
            out.push_str(&self.taxa[node]);
        }
    }
}

struct NewickParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    children: Vec<Vec<usize>>,
    lengths: Vec<f64>,
    labels: Vec<Option<String>>,
}

impl<'a> NewickParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
            children: Vec::new(),
            lengths: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn parse(mut self, taxa: &[String]) -> Result<RootedShape> {
        self.skip_blank();
        let root = self.subtree(0)?;
        self.skip_blank();
        if self.peek() != Some(b';') {
            return Err(self.error("expected ';'"));
        }

        let mut taxon = vec![None; self.children.len()];
        let mut used = vec![false; taxa.len()];
        for node in 0..self.children.len() {
            if !self.children[node].is_empty() {
                continue;
            }
            let label = self.labels[node]
                .as_deref()
                .ok_or_else(|| PhyloError::malformed("unlabelled leaf in Newick string"))?;
            let t = taxa
                .iter()
                .position(|name| name == label)
                .ok_or_else(|| PhyloError::malformed(format!("unknown taxon '{label}' in tree")))?;
            if used[t] {
                return Err(PhyloError::malformed(format!("taxon '{label}' appears twice in tree")));
            }
            used[t] = true;
            taxon[node] = Some(t);
        }
        if let Some(t) = used.iter().position(|&u| !u) {
            return Err(PhyloError::malformed(format!("taxon '{}' missing from tree", taxa[t])));
        }

        Ok(RootedShape {
            children: self.children,
            lengths: self.lengths,
            taxon,
            root,
        })
    }

    fn subtree(&mut self, depth: usize) -> Result<usize> {
        if depth > 100_000 {
            return Err(self.error("tree nesting too deep"));
        }
        let id = self.children.len();
        self.children.push(Vec::new());
        self.lengths.push(0.0);
        self.labels.push(None);

        self.skip_blank();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.subtree(depth + 1)?;
                self.children[id].push(child);
                self.skip_blank();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }

        self.skip_blank();
        let label = self.label()?;
        if !label.is_empty() {
            self.labels[id] = Some(label);
        }
        self.skip_blank();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_blank();
            self.lengths[id] = self.number()?;
        }
        Ok(id)
    }

    fn label(&mut self) -> Result<String> {
        if self.peek() == Some(b'\'') {
            self.pos += 1;
            let start = self.pos;
            while self.peek().is_some_and(|b| b != b'\'') {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Err(self.error("unterminated quoted label"));
            }
            let label = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
            self.pos += 1;
            return Ok(label);
        }
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[') && !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .map_err(|_| self.error(&format!("invalid branch length '{text}'")))
    }

    /// Whitespace and `[...]` comments
    fn skip_blank(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'[') => {
                    while self.peek().is_some_and(|b| b != b']') {
                        self.pos += 1;
                    }
                    if self.peek().is_some() {
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, msg: &str) -> PhyloError {
        PhyloError::malformed(format!("Newick parse error at byte {}: {msg}", self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rooted_newick_is_unrooted() {
        let tree = Tree::from_newick(
            "((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);",
            &names(&["A", "B", "C", "D"]),
        )
        .unwrap();
        assert_eq!(tree.n_nodes(), 6);
        assert_eq!(tree.n_edges(), 5);
        let internal = tree.edge_between(4, 5).unwrap();
        assert_abs_diff_eq!(tree.branch_length(internal), 0.11, epsilon = 1e-12);
        assert_abs_diff_eq!(tree.total_length(), 1.11, epsilon = 1e-12);
    }

    #[test]
    fn test_trifurcating_root() {
        let tree = Tree::from_newick("(A:0.1,B:0.2,(C:0.3,D:0.4)x:0.5)y;", &names(&["A", "B", "C", "D"])).unwrap();
        assert_eq!(tree.n_edges(), 5);
        assert!(tree.neighbors(0).len() == 1 && !tree.is_leaf(4));
    }

    #[test]
    fn test_two_taxa() {
        let tree = Tree::from_newick("(A:0.1,B:0.25);", &names(&["A", "B"])).unwrap();
        assert_eq!(tree.n_edges(), 1);
        assert_abs_diff_eq!(tree.branch_length(0), 0.35, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_multifurcation() {
        let err = Tree::from_newick("(A:1,B:1,C:1,D:1);", &names(&["A", "B", "C", "D"]));
        assert!(matches!(err, Err(PhyloError::MalformedInput(_))));
    }

    #[test]
    fn test_rejects_unknown_taxon() {
        assert!(Tree::from_newick("(A:1,B:1,E:1);", &names(&["A", "B", "C"])).is_err());
        assert!(Tree::from_newick("(A:1,B:1,C:1)", &names(&["A", "B", "C"])).is_err());
    }

    #[test]
    fn test_branch_ids() {
        let tree = Tree::from_newick("(A:0.1,B:0.2,C:0.3);", &names(&["A", "B", "C"])).unwrap();
        let b = tree.branch(0, 3).unwrap();
        assert_eq!(tree.branch_source(b), 0);
        assert_eq!(tree.branch_target(b), 3);
        assert_eq!(tree.branch(3, 0), Some(b.reverse()));
        let children: Vec<NodeId> = tree.child_branches(b).map(|c| tree.branch_target(c)).collect();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&1) && children.contains(&2));
    }

    #[test]
    fn test_edges_postorder_covers_all() {
        let tree = Tree::from_newick(
            "((A:1,B:1):1,(C:1,(D:1,E:1):1):1);",
            &names(&["A", "B", "C", "D", "E"]),
        )
        .unwrap();
        let mut order = tree.edges_postorder();
        assert_eq!(order.len(), tree.n_edges());
        assert_eq!(*order.last().unwrap(), tree.default_edge());
        order.sort_unstable();
        order.dedup();
        assert_eq!(order.len(), tree.n_edges());
    }

    #[test]
    fn test_tree_from_structure() {
        // ((A,B),C) rooted at 4; root is suppressed
        let structure = vec![(0, Some(3)), (1, Some(3)), (2, Some(4)), (3, Some(4)), (4, None)];
        let branch_lengths = vec![0.1, 0.1, 0.2, 0.1, 0.0];
        let tree = Tree::from_structure(structure, branch_lengths, names(&["A", "B", "C"]), vec![0, 1, 2]).unwrap();
        assert_eq!(tree.n_nodes(), 4);
        let e = tree.edge_between(2, 3).unwrap();
        assert_abs_diff_eq!(tree.branch_length(e), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_newick_round_trip() {
        let taxa = names(&["A", "B", "C", "D"]);
        let tree = Tree::from_newick("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);", &taxa).unwrap();
        let again = Tree::from_newick(&tree.to_newick(), &taxa).unwrap();
        assert_abs_diff_eq!(again.total_length(), tree.total_length(), epsilon = 1e-12);
    }
}
