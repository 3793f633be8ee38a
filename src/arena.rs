/// Index-addressed pool of partial-likelihood buffers
///
/// Buffers are allocated once per tree. Directed branches hold slot indices;
/// re-orienting a cache moves the index, never the data.

use aligned_vec::{AVec, ConstAlign};

use crate::config::MemoryMode;
use crate::error::{PhyloError, Result};
use crate::tree::{BranchId, Tree};

pub type SlotId = usize;

pub type AlignedBuf = AVec<f64, ConstAlign<32>>;

pub fn aligned_zeros(len: usize) -> AlignedBuf {
    AVec::from_iter(32, std::iter::repeat(0.0).take(len))
}

/// One branch's partial likelihoods and per-pattern rescale counts
pub struct PartialSlot {
    /// Layout `[pattern][category][state]`
    pub lh: AlignedBuf,
    pub scale_num: Vec<u16>,
}

pub struct PartialArena {
    mode: MemoryMode,
    slots: Vec<Option<PartialSlot>>,
    owner: Vec<Option<BranchId>>,
    branch_slot: Vec<Option<SlotId>>,
    slot_len: usize,
}

impl PartialArena {
    /// `slot_len` is the number of doubles per slot, `n_patterns` sizes the scale counters
    pub fn new(tree: &Tree, mode: MemoryMode, slot_len: usize, n_patterns: usize) -> Self {
        let n_branches = 2 * tree.n_edges();
        let mut arena = Self {
            mode,
            slots: Vec::new(),
            owner: Vec::new(),
            branch_slot: vec![None; n_branches],
            slot_len,
        };

        let assign = |arena: &mut Self, branch: BranchId| {
            let slot = arena.slots.len();
            arena.slots.push(Some(PartialSlot {
                lh: aligned_zeros(slot_len),
                scale_num: vec![0; n_patterns],
            }));
            arena.owner.push(Some(branch));
            arena.branch_slot[branch.0] = Some(slot);
        };

        match mode {
            MemoryMode::Full => {
                for b in 0..n_branches {
                    let branch = BranchId(b);
                    if !tree.is_leaf(tree.branch_target(branch)) {
                        assign(&mut arena, branch);
                    }
                }
            }
            MemoryMode::PerNode => {
                for node in tree.n_taxa()..tree.n_nodes() {
                    let nb = tree.neighbors(node)[0];
                    if let Some(branch) = tree.branch(nb.node, node) {
                        assign(&mut arena, branch);
                    }
                }
            }
        }
        arena
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    #[inline]
    pub fn slot_of(&self, branch: BranchId) -> Option<SlotId> {
        self.branch_slot[branch.0]
    }

    /// Move the slot held by `from` to `to`; `to` must not hold one
    pub fn transfer(&mut self, from: BranchId, to: BranchId) -> Result<SlotId> {
        if self.branch_slot[to.0].is_some() {
            return Err(PhyloError::consistency(format!(
                "branch {} already owns a partial-likelihood slot",
                to.0
            )));
        }
        let slot = self.branch_slot[from.0].take().ok_or_else(|| {
            PhyloError::consistency(format!("branch {} owns no slot to transfer", from.0))
        })?;
        self.branch_slot[to.0] = Some(slot);
        self.owner[slot] = Some(to);
        Ok(slot)
    }

    /// Check the buffer out for writing; must be returned with `put`
    pub fn take(&mut self, slot: SlotId) -> Result<PartialSlot> {
        self.slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| PhyloError::consistency(format!("slot {slot} is already checked out")))
    }

    pub fn put(&mut self, slot: SlotId, data: PartialSlot) {
        self.slots[slot] = Some(data);
    }

    pub fn get(&self, slot: SlotId) -> Result<&PartialSlot> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| PhyloError::consistency(format!("slot {slot} is checked out")))
    }

    /// Every slot has exactly one owner and the two index tables agree.
    /// Full mode: each branch into an internal node holds a slot.
    /// Per-node mode: exactly one branch into each internal node holds one.
    pub fn check_invariant(&self, tree: &Tree) -> Result<()> {
        let mut claimed = vec![0usize; self.slots.len()];
        for (b, slot) in self.branch_slot.iter().enumerate() {
            let Some(slot) = *slot else { continue };
            if tree.is_leaf(tree.branch_target(BranchId(b))) {
                return Err(PhyloError::consistency(format!("branch {b} into a leaf holds slot {slot}")));
            }
            claimed[slot] += 1;
            if self.owner[slot] != Some(BranchId(b)) {
                return Err(PhyloError::consistency(format!(
                    "slot {slot} is held by branch {b} but recorded for {:?}",
                    self.owner[slot]
                )));
            }
        }
        if let Some(slot) = claimed.iter().position(|&c| c != 1) {
            return Err(PhyloError::consistency(format!(
                "slot {slot} has {} owners",
                claimed[slot]
            )));
        }
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            return Err(PhyloError::consistency(format!("slot {slot} was never returned")));
        }

        for node in tree.n_taxa()..tree.n_nodes() {
            let holding = tree
                .neighbors(node)
                .iter()
                .filter_map(|nb| tree.branch(nb.node, node))
                .filter(|b| self.branch_slot[b.0].is_some())
                .count();
            let expected = match self.mode {
                MemoryMode::Full => 3,
                MemoryMode::PerNode => 1,
            };
            if holding != expected {
                return Err(PhyloError::consistency(format!(
                    "internal node {node} has {holding} live incoming caches, expected {expected}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quartet() -> Tree {
        let taxa: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        Tree::from_newick("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);", &taxa).unwrap()
    }

    #[test]
    fn test_full_mode_slot_count() {
        let tree = quartet();
        let arena = PartialArena::new(&tree, MemoryMode::Full, 8, 2);
        assert_eq!(arena.n_slots(), 6);
        arena.check_invariant(&tree).unwrap();
    }

    #[test]
    fn test_per_node_transfer_keeps_invariant() {
        let tree = quartet();
        let mut arena = PartialArena::new(&tree, MemoryMode::PerNode, 8, 2);
        assert_eq!(arena.n_slots(), 2);
        arena.check_invariant(&tree).unwrap();

        let node = 4;
        let holder = tree
            .neighbors(node)
            .iter()
            .filter_map(|nb| tree.branch(nb.node, node))
            .find(|b| arena.slot_of(*b).is_some())
            .unwrap();
        let other = tree
            .neighbors(node)
            .iter()
            .filter_map(|nb| tree.branch(nb.node, node))
            .find(|b| *b != holder)
            .unwrap();
        let slot = arena.slot_of(holder).unwrap();
        assert_eq!(arena.transfer(holder, other).unwrap(), slot);
        arena.check_invariant(&tree).unwrap();
        assert!(arena.transfer(holder, other).is_err());
    }

    #[test]
    fn test_checked_out_slot_fails_invariant() {
        let tree = quartet();
        let mut arena = PartialArena::new(&tree, MemoryMode::Full, 8, 2);
        let data = arena.take(0).unwrap();
        assert!(arena.take(0).is_err());
        assert!(arena.check_invariant(&tree).is_err());
        arena.put(0, data);
        arena.check_invariant(&tree).unwrap();
    }
}
