/// Felsenstein pruning in the eigenbasis of the rate matrix
///
/// Partial likelihoods are stored per (pattern, category, eigen coordinate):
/// the real-space conditional likelihood of a subtree projected by U^{-1}.
/// Moving a partial across a branch of length t then costs one
/// `U diag(exp(λ r t))` product, and the likelihood at an edge is
///
///   L = Σ_c w_c Σ_i exp(λ_i r_c t) · A[c][i] · B[c][i]
///
/// with A and B the eigen-basis partials on either side.
///
/// Key points:
/// 1. Partials are cached per directed branch and only recomputed when a
///    branch length below them changes
/// 2. Pattern loops run on the engine's own rayon pool
/// 3. Blocks whose largest entry drops below 2^-256 are rescaled by 2^256

use std::sync::Arc;

use ndarray::prelude::*;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::alignment::PatternSet;
use crate::arena::{PartialArena, PartialSlot, SlotId};
use crate::branch::ThetaBuffer;
use crate::checkpoint::Checkpoint;
use crate::config::{EngineConfig, Scaling};
use crate::error::{PhyloError, Result};
use crate::kernel::Kernel;
use crate::model::SubstitutionModel;
use crate::rates::{RateHeterogeneity, SiteRates};
use crate::tree::{BranchId, EdgeId, NodeId, Tree};

/// 2^-256
pub const SCALING_THRESHOLD: f64 = 8.636_168_555_094_444_6e-78;
/// 2^256
pub const SCALING_THRESHOLD_INVER: f64 = 1.157_920_892_373_162_0e77;
/// ln(2^-256)
pub const LOG_SCALING_THRESHOLD: f64 = -256.0 * std::f64::consts::LN_2;
/// Per-pattern log-likelihood substituted for non-finite values
pub const MIN_PATTERN_LOG_LIKELIHOOD: f64 = 4.0 * LOG_SCALING_THRESHOLD;

/// Cache behaviour counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub partials_computed: usize,
    /// Pattern blocks multiplied by 2^256 during pruning
    pub rescaled_blocks: usize,
    pub theta_builds: usize,
    pub buffer_evaluations: usize,
}

/// Row-major copies of the model's eigensystem
#[derive(Debug, Clone)]
pub(crate) struct EigenCache {
    pub(crate) u: Vec<f64>,
    pub(crate) u_inv: Vec<f64>,
    pub(crate) lambda: Vec<f64>,
}

impl EigenCache {
    fn from_model(model: &dyn SubstitutionModel) -> Self {
        let eigen = model.eigen();
        Self {
            u: eigen.eigenvectors.iter().copied().collect(),
            u_inv: eigen.eigenvectors_inv.iter().copied().collect(),
            lambda: eigen.eigenvalues.to_vec(),
        }
    }
}

/// What one side of an edge contributes at a pattern
#[derive(Clone, Copy)]
pub(crate) enum Side<'a> {
    /// Eigen-basis indicator vectors `[code][state]`, shared by all categories
    Tip {
        taxon: usize,
        patterns: &'a PatternSet,
        tip_lh: &'a [f64],
        n_states: usize,
    },
    Internal {
        slot: &'a PartialSlot,
        block: usize,
        n_states: usize,
    },
}

impl<'a> Side<'a> {
    #[inline]
    pub(crate) fn category(&self, ptn: usize, cat: usize) -> &'a [f64] {
        match *self {
            Side::Tip {
                taxon,
                patterns,
                tip_lh,
                n_states,
            } => {
                let code = usize::from(patterns.state(ptn, taxon));
                &tip_lh[code * n_states..(code + 1) * n_states]
            }
            Side::Internal { slot, block, n_states } => {
                let start = ptn * block + cat * n_states;
                &slot.lh[start..start + n_states]
            }
        }
    }

    #[inline]
    pub(crate) fn scale_count(&self, ptn: usize) -> u16 {
        match self {
            Side::Tip { .. } => 0,
            Side::Internal { slot, .. } => slot.scale_num[ptn],
        }
    }
}

/// A child subtree as seen from the node being computed
enum ChildSource<'a> {
    /// Real-space likelihood of the leaf below the branch, `[code][cat][state]`,
    /// built only for the codes the leaf carries
    Tip { taxon: usize, table: Vec<f64> },
    /// Eigen-basis partials plus `[cat][x][i] = U[x][i] exp(λ_i r_c t)`
    Internal { slot: &'a PartialSlot, to_real: Vec<f64> },
}

impl ChildSource<'_> {
    /// Real-space conditional likelihood at pattern `ptn` into `dst`; returns the scale count
    #[inline]
    fn fill_real(&self, ptn: usize, n: usize, kernel: Kernel, patterns: &PatternSet, dst: &mut [f64]) -> u16 {
        let block = dst.len();
        match self {
            ChildSource::Tip { taxon, table } => {
                let code = usize::from(patterns.state(ptn, *taxon));
                dst.copy_from_slice(&table[code * block..(code + 1) * block]);
                0
            }
            ChildSource::Internal { slot, to_real } => {
                let src = &slot.lh[ptn * block..(ptn + 1) * block];
                for (row, (out, m)) in dst.iter_mut().zip(to_real.chunks_exact(n)).enumerate() {
                    let cat = row / n;
                    *out = kernel.dot(m, &src[cat * n..(cat + 1) * n]);
                }
                slot.scale_num[ptn]
            }
        }
    }
}

/// Likelihood engine over one tree, one alignment and one model
pub struct LikelihoodEngine {
    pub(crate) tree: Tree,
    pub(crate) patterns: Arc<PatternSet>,
    pub(crate) model: Arc<dyn SubstitutionModel>,
    pub(crate) rates: SiteRates,
    pub(crate) config: EngineConfig,
    pub(crate) pool: Arc<ThreadPool>,
    pub(crate) kernel: Kernel,
    pub(crate) eigen: EigenCache,
    n_states: usize,
    arena: PartialArena,
    /// Per directed branch
    computed: Vec<bool>,
    /// Per directed branch: Σ_ptn freq · scale count · ln(2^-256) of the subtree
    scale_factor: Vec<f64>,
    /// `[code][state]` in eigen coordinates
    tip_lh: Vec<f64>,
    tips_stale: bool,
    /// Site counts per pattern; zero for unobserved patterns
    pub(crate) ptn_freq: Vec<f64>,
    pub(crate) n_sites: f64,
    pub(crate) theta: ThetaBuffer,
    /// Per observed pattern, including scaling and ascertainment shift
    pub(crate) pattern_lh: Vec<f64>,
    /// Probability of an unobservable pattern at the last evaluation
    pub(crate) asc_mass: f64,
    pub(crate) current_edge: EdgeId,
    pub(crate) stats: EngineStats,
}

impl LikelihoodEngine {
    /// Build an engine with its own thread pool
    pub fn new(
        tree: Tree,
        patterns: Arc<PatternSet>,
        model: Arc<dyn SubstitutionModel>,
        rates: SiteRates,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("phylolik-{i}"));
        if config.n_threads > 0 {
            builder = builder.num_threads(config.n_threads);
        }
        let pool = Arc::new(builder.build()?);
        Self::with_pool(tree, patterns, model, rates, config, pool)
    }

    /// Build an engine sharing an existing pool
    pub fn with_pool(
        tree: Tree,
        patterns: Arc<PatternSet>,
        model: Arc<dyn SubstitutionModel>,
        rates: SiteRates,
        config: EngineConfig,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        config.validate()?;
        if tree.taxa() != patterns.taxa() {
            return Err(PhyloError::malformed(
                "tree leaves and alignment rows must name the same taxa in the same order",
            ));
        }
        check_model(model.as_ref(), &patterns)?;

        let n_states = model.n_states();
        let n_total = patterns.n_total_patterns();
        let block = rates.n_categories() * n_states;
        let ptn_freq = patterns.frequencies();
        let n_sites = ptn_freq.iter().sum();
        let n_branches = 2 * tree.n_edges();

        Ok(Self {
            arena: PartialArena::new(&tree, config.memory_mode, n_total * block, n_total),
            theta: ThetaBuffer::new(n_total * block, n_total),
            computed: vec![false; n_branches],
            scale_factor: vec![0.0; n_branches],
            tip_lh: vec![0.0; patterns.n_codes() * n_states],
            tips_stale: true,
            pattern_lh: vec![0.0; patterns.n_patterns()],
            asc_mass: 0.0,
            current_edge: tree.default_edge(),
            stats: EngineStats::default(),
            eigen: EigenCache::from_model(model.as_ref()),
            kernel: Kernel::current(),
            n_states,
            ptn_freq,
            n_sites,
            tree,
            patterns,
            model,
            rates,
            config,
            pool,
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn model(&self) -> &dyn SubstitutionModel {
        self.model.as_ref()
    }

    pub fn site_rates(&self) -> &SiteRates {
        &self.rates
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Force a kernel, e.g. to compare against the scalar path
    pub fn set_kernel(&mut self, kernel: Kernel) {
        self.kernel = kernel;
    }

    pub fn current_edge(&self) -> EdgeId {
        self.current_edge
    }

    pub fn set_current_edge(&mut self, edge: EdgeId) -> Result<()> {
        if edge >= self.tree.n_edges() {
            return Err(PhyloError::invalid("edge", format!("no edge {edge}")));
        }
        self.current_edge = edge;
        Ok(())
    }

    /// Σ of the pattern frequencies
    pub fn n_sites(&self) -> f64 {
        self.n_sites
    }

    #[inline]
    pub(crate) fn n_categories(&self) -> usize {
        self.rates.n_categories()
    }

    #[inline]
    pub(crate) fn block(&self) -> usize {
        self.n_categories() * self.n_states
    }

    #[inline]
    pub(crate) fn n_states(&self) -> usize {
        self.n_states
    }

    #[inline]
    pub(crate) fn min_chunk(&self) -> usize {
        self.config.min_parallel_patterns.max(1)
    }

    // ---- state changes -------------------------------------------------

    /// Drop every cached partial likelihood and the theta buffer
    pub fn clear_all_partial_lh(&mut self) {
        self.computed.fill(false);
        self.scale_factor.fill(0.0);
        self.theta.invalidate();
    }

    /// Change one branch length and invalidate the partials that depend on it
    ///
    /// Every directed branch whose subtree contains `edge` is invalidated; the
    /// two directed branches of `edge` itself and a theta buffer built on it
    /// stay valid.
    pub fn set_branch_length(&mut self, edge: EdgeId, length: f64) -> Result<()> {
        if edge >= self.tree.n_edges() {
            return Err(PhyloError::invalid("edge", format!("no edge {edge}")));
        }
        if !(length >= 0.0) || !length.is_finite() {
            return Err(PhyloError::invalid("branch_length", format!("invalid length {length}")));
        }
        if self.tree.branch_length(edge) == length {
            return Ok(());
        }
        self.tree.set_branch_length(edge, length);
        self.invalidate_around(edge);
        Ok(())
    }

    fn invalidate_around(&mut self, edge: EdgeId) {
        let tree = &self.tree;
        let (a, b) = (tree.edge(edge).a, tree.edge(edge).b);
        // (node, the neighbor we came from)
        let mut stack = vec![(a, b), (b, a)];
        while let Some((node, from)) = stack.pop() {
            for nb in tree.neighbors(node) {
                if nb.node == from {
                    continue;
                }
                let toward = BranchId::new(nb.edge, tree.edge(nb.edge).a != nb.node);
                self.computed[toward.0] = false;
                stack.push((nb.node, node));
            }
        }
        if self.theta.edge != Some(edge) {
            self.theta.invalidate();
        }
    }

    pub fn set_branch_lengths(&mut self, lengths: &[f64]) -> Result<()> {
        if lengths.len() != self.tree.n_edges() {
            return Err(PhyloError::invalid(
                "branch_lengths",
                format!("expected {} lengths, got {}", self.tree.n_edges(), lengths.len()),
            ));
        }
        if let Some(bad) = lengths.iter().find(|l| !(**l >= 0.0) || !l.is_finite()) {
            return Err(PhyloError::invalid("branch_lengths", format!("invalid length {bad}")));
        }
        self.tree.set_branch_lengths(lengths);
        self.clear_all_partial_lh();
        Ok(())
    }

    /// Multiply every branch length by `factor`
    pub fn scale_branch_lengths(&mut self, factor: f64) {
        self.tree.scale_lengths(factor);
        self.clear_all_partial_lh();
    }

    /// Swap the substitution model; all partials and tip vectors are rebuilt
    pub fn set_model(&mut self, model: Arc<dyn SubstitutionModel>) -> Result<()> {
        check_model(model.as_ref(), &self.patterns)?;
        if model.n_states() != self.n_states {
            return Err(PhyloError::UnsupportedModel(format!(
                "model has {} states, engine was built for {}",
                model.n_states(),
                self.n_states
            )));
        }
        self.eigen = EigenCache::from_model(model.as_ref());
        self.model = model;
        self.tips_stale = true;
        self.clear_all_partial_lh();
        Ok(())
    }

    /// Swap the rate model
    ///
    /// Partials depend on the category rates only, so a change that keeps
    /// every rate (weights only) keeps the caches.
    pub fn set_site_rates(&mut self, rates: SiteRates) {
        let same_rates = rates.rates() == self.rates.rates();
        let resized = rates.n_categories() != self.rates.n_categories();
        self.rates = rates;
        if resized {
            let n_total = self.patterns.n_total_patterns();
            let slot_len = n_total * self.block();
            self.arena = PartialArena::new(&self.tree, self.config.memory_mode, slot_len, n_total);
            self.theta = ThetaBuffer::new(slot_len, n_total);
        }
        if !same_rates || resized {
            self.clear_all_partial_lh();
        }
    }

    /// Replace the per-pattern weights of the observed patterns
    pub fn set_pattern_frequencies(&mut self, frequencies: &[f64]) -> Result<()> {
        let n_obs = self.patterns.n_patterns();
        if frequencies.len() != n_obs {
            return Err(PhyloError::invalid(
                "pattern_frequencies",
                format!("expected {n_obs} values, got {}", frequencies.len()),
            ));
        }
        if frequencies.iter().any(|f| !(*f >= 0.0) || !f.is_finite()) {
            return Err(PhyloError::invalid("pattern_frequencies", "must be finite and non-negative"));
        }
        self.ptn_freq[..n_obs].copy_from_slice(frequencies);
        self.n_sites = frequencies.iter().sum();
        self.clear_all_partial_lh();
        Ok(())
    }

    pub fn pattern_frequencies(&self) -> &[f64] {
        &self.ptn_freq[..self.patterns.n_patterns()]
    }

    // ---- pruning -------------------------------------------------------

    fn refresh_tips(&mut self) {
        if !self.tips_stale {
            return;
        }
        let n = self.n_states;
        for code in 0..self.patterns.n_codes() {
            let mask = self.patterns.compatible_states(code as u8);
            for i in 0..n {
                let row = &self.eigen.u_inv[i * n..(i + 1) * n];
                self.tip_lh[code * n + i] = (0..n).filter(|x| (mask >> x) & 1 == 1).map(|x| row[x]).sum();
            }
        }
        self.tips_stale = false;
    }

    /// `[cat][x][i] = U[x][i] exp(λ_i r_c t)`
    pub(crate) fn to_real_matrix(&self, length: f64) -> Vec<f64> {
        let n = self.n_states;
        let mut out = Vec::with_capacity(self.block() * n);
        for &rate in self.rates.rates() {
            let decay: Vec<f64> = self.eigen.lambda.iter().map(|l| (l * rate * length).exp()).collect();
            for x in 0..n {
                out.extend(self.eigen.u[x * n..(x + 1) * n].iter().zip(&decay).map(|(u, d)| u * d));
            }
        }
        out
    }

    /// Make sure the partial likelihood cached on `branch` is current
    ///
    /// Walks the stale part of the subtree with an explicit post-order work
    /// list, so deep trees do not recurse.
    pub fn compute_partial_likelihood(&mut self, branch: BranchId) -> Result<()> {
        if branch.0 >= self.computed.len() {
            return Err(PhyloError::invalid("branch", format!("no directed branch {}", branch.0)));
        }
        self.refresh_tips();

        let mut order = Vec::new();
        let mut stack = vec![(branch, false)];
        while let Some((b, expanded)) = stack.pop() {
            if self.tree.is_leaf(self.tree.branch_target(b)) || self.computed[b.0] {
                continue;
            }
            if expanded {
                order.push(b);
                continue;
            }
            stack.push((b, true));
            stack.extend(self.tree.child_branches(b).map(|c| (c, false)));
        }

        for b in order {
            self.compute_one_partial(b)?;
        }
        Ok(())
    }

    fn compute_one_partial(&mut self, branch: BranchId) -> Result<()> {
        let slot = match self.arena.slot_of(branch) {
            Some(slot) => slot,
            None => self.reclaim_slot(branch)?,
        };
        let children: Vec<BranchId> = self.tree.child_branches(branch).collect();
        let &[left, right] = children.as_slice() else {
            return Err(PhyloError::consistency(format!(
                "node {} is not bifurcating",
                self.tree.branch_target(branch)
            )));
        };

        let mut out = self.arena.take(slot)?;
        let filled = self.fill_partial(left, right, &mut out);
        self.arena.put(slot, out);

        let (scale, rescaled) = filled?;
        self.scale_factor[branch.0] = scale;
        self.computed[branch.0] = true;
        self.stats.partials_computed += 1;
        self.stats.rescaled_blocks += rescaled;
        Ok(())
    }

    /// Per-node memory: move the node's only slot onto `branch`
    fn reclaim_slot(&mut self, branch: BranchId) -> Result<SlotId> {
        let node = self.tree.branch_target(branch);
        let holder = self
            .tree
            .neighbors(node)
            .iter()
            .filter_map(|nb| self.tree.branch(nb.node, node))
            .find(|b| self.arena.slot_of(*b).is_some())
            .ok_or_else(|| PhyloError::consistency(format!("no partial-likelihood slot left at node {node}")))?;
        self.computed[holder.0] = false;
        self.arena.transfer(holder, branch)
    }

    fn child_source(&self, child: BranchId) -> Result<ChildSource<'_>> {
        let n = self.n_states;
        let block = self.block();
        let to_real = self.to_real_matrix(self.tree.branch_length(child.edge()));
        let target = self.tree.branch_target(child);

        if self.tree.is_leaf(target) {
            let mut table = vec![0.0; self.patterns.n_codes() * block];
            for code in self.patterns.leaf_codes(target) {
                let code = usize::from(code);
                let tip = &self.tip_lh[code * n..(code + 1) * n];
                for (row, m) in to_real.chunks_exact(n).enumerate() {
                    table[code * block + row] = self.kernel.dot(m, tip);
                }
            }
            return Ok(ChildSource::Tip { taxon: target, table });
        }

        if !self.computed[child.0] {
            return Err(PhyloError::consistency(format!(
                "partial likelihood of branch {} used before it was computed",
                child.0
            )));
        }
        let slot = self
            .arena
            .slot_of(child)
            .ok_or_else(|| PhyloError::consistency(format!("computed branch {} holds no slot", child.0)))?;
        Ok(ChildSource::Internal {
            slot: self.arena.get(slot)?,
            to_real,
        })
    }

    /// Fill `out` from two children: cherry (two tips), tip-internal, or
    /// internal-internal. Returns the branch's accumulated scale factor and
    /// the number of blocks rescaled here.
    fn fill_partial(&self, left: BranchId, right: BranchId, out: &mut PartialSlot) -> Result<(f64, usize)> {
        let left = self.child_source(left)?;
        let right = self.child_source(right)?;
        let n = self.n_states;
        let n_cat = self.n_categories();
        let block = self.block();
        let kernel = self.kernel;
        let scaling = self.config.scaling;
        let patterns = self.patterns.as_ref();
        let freq = &self.ptn_freq;
        let u_inv = &self.eigen.u_inv;
        let min_len = self.min_chunk();

        let PartialSlot { lh, scale_num } = out;
        let (scale, rescaled) = self.pool.install(|| {
            lh.par_chunks_mut(block)
                .zip(scale_num.par_iter_mut())
                .enumerate()
                .with_min_len(min_len)
                .map_init(
                    || vec![0.0; 3 * block],
                    |scratch, (ptn, (dst, count_out))| -> Result<(f64, usize)> {
                        let (real_left, rest) = scratch.split_at_mut(block);
                        let (real_right, product) = rest.split_at_mut(block);
                        let count_left = left.fill_real(ptn, n, kernel, patterns, real_left);
                        let count_right = right.fill_real(ptn, n, kernel, patterns, real_right);
                        kernel.mul_into(product, real_left, real_right);

                        // Back to eigen coordinates: out[c][i] = Σ_x U^{-1}[i][x] product[c][x]
                        for cat in 0..n_cat {
                            let prod = &product[cat * n..(cat + 1) * n];
                            for (i, row) in u_inv.chunks_exact(n).enumerate() {
                                dst[cat * n + i] = kernel.dot(row, prod);
                            }
                        }

                        let mut count = add_scale_counts(count_left, count_right)?;
                        let rescale = scaling == Scaling::Auto && kernel.max_abs(dst) < SCALING_THRESHOLD;
                        if rescale {
                            kernel.scale(dst, SCALING_THRESHOLD_INVER);
                            count = add_scale_counts(count, 1)?;
                        }
                        *count_out = count;
                        Ok((freq[ptn] * f64::from(count) * LOG_SCALING_THRESHOLD, usize::from(rescale)))
                    },
                )
                .try_reduce(|| (0.0, 0), |a, b| Ok((a.0 + b.0, a.1 + b.1)))
        })?;
        Ok((scale, rescaled))
    }

    /// Read access to the partial of one side of an edge; `branch` must be current
    pub(crate) fn side(&self, branch: BranchId) -> Result<Side<'_>> {
        let target = self.tree.branch_target(branch);
        if self.tree.is_leaf(target) {
            return Ok(Side::Tip {
                taxon: target,
                patterns: self.patterns.as_ref(),
                tip_lh: &self.tip_lh,
                n_states: self.n_states,
            });
        }
        if !self.computed[branch.0] {
            return Err(PhyloError::consistency(format!("branch {} is not computed", branch.0)));
        }
        let slot = self
            .arena
            .slot_of(branch)
            .ok_or_else(|| PhyloError::consistency(format!("computed branch {} holds no slot", branch.0)))?;
        Ok(Side::Internal {
            slot: self.arena.get(slot)?,
            block: self.block(),
            n_states: self.n_states,
        })
    }

    #[inline]
    pub(crate) fn branch_scale_factor(&self, branch: BranchId) -> f64 {
        if self.tree.is_leaf(self.tree.branch_target(branch)) {
            0.0
        } else {
            self.scale_factor[branch.0]
        }
    }

    // ---- likelihood ------------------------------------------------------

    /// Log-likelihood evaluated at `edge`; makes it the current edge
    pub fn compute_likelihood_branch(&mut self, edge: EdgeId) -> Result<f64> {
        if edge >= self.tree.n_edges() {
            return Err(PhyloError::invalid("edge", format!("no edge {edge}")));
        }
        self.current_edge = edge;
        self.compute_theta(edge)?;
        self.compute_likelihood_from_buffer()
    }

    /// Log-likelihood at the current edge
    pub fn compute_likelihood(&mut self) -> Result<f64> {
        self.compute_likelihood_branch(self.current_edge)
    }

    /// Log-likelihood of every observed pattern at the last evaluation
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        &self.pattern_lh
    }

    /// Log-likelihood of every alignment site
    pub fn site_log_likelihoods(&mut self) -> Result<Vec<f64>> {
        self.compute_likelihood()?;
        Ok(self
            .patterns
            .site_patterns()
            .iter()
            .map(|&p| self.pattern_lh[p])
            .collect())
    }

    /// Probability of drawing an unobservable pattern at the current parameters
    pub fn ascertainment_mass(&mut self) -> Result<f64> {
        if !self.patterns.has_ascertainment() {
            return Ok(0.0);
        }
        self.compute_likelihood()?;
        Ok(self.asc_mass)
    }

    /// Per observed pattern and category: w_c · L(pattern | category)
    ///
    /// Values carry the pattern's scaling, which cancels in any per-pattern
    /// ratio such as EM posteriors.
    pub fn compute_pattern_lh_cat(&mut self) -> Result<Array2<f64>> {
        let edge = self.current_edge;
        self.compute_theta(edge)?;
        let n = self.n_states;
        let n_cat = self.n_categories();
        let n_obs = self.patterns.n_patterns();
        let block = self.block();
        let length = self.tree.branch_length(edge);

        let mut val0 = Vec::with_capacity(block);
        for (&rate, &weight) in self.rates.rates().iter().zip(self.rates.weights()) {
            val0.extend(self.eigen.lambda.iter().map(|l| weight * (l * rate * length).exp()));
        }
        let kernel = self.kernel;
        let theta = &self.theta.lh[..n_obs * block];
        let mut out = vec![0.0; n_obs * n_cat];
        let min_len = self.min_chunk();
        self.pool.install(|| {
            out.par_chunks_mut(n_cat)
                .zip(theta.par_chunks(block))
                .with_min_len(min_len)
                .for_each(|(row, th)| {
                    for (cat, v) in row.iter_mut().enumerate() {
                        let range = cat * n..(cat + 1) * n;
                        *v = kernel.dot(&th[range.clone()], &val0[range]);
                    }
                });
        });
        Array2::from_shape_vec((n_obs, n_cat), out).map_err(|e| PhyloError::consistency(e.to_string()))
    }

    /// Replace non-finite pattern log-likelihoods by a floor and report the sites
    pub(crate) fn floor_non_finite(&mut self) -> f64 {
        let mut bad = vec![false; self.pattern_lh.len()];
        for (ptn, lh) in self.pattern_lh.iter_mut().enumerate() {
            if !lh.is_finite() {
                *lh = MIN_PATTERN_LOG_LIKELIHOOD;
                bad[ptn] = true;
            }
        }
        let sites: Vec<usize> = self
            .patterns
            .site_patterns()
            .iter()
            .enumerate()
            .filter(|(_, &p)| bad[p])
            .map(|(site, _)| site + 1)
            .collect();
        warn!(
            ?sites,
            floor = MIN_PATTERN_LOG_LIKELIHOOD,
            "numerical underflow at sites, log-likelihood floored"
        );
        self.pattern_lh
            .iter()
            .zip(&self.ptn_freq)
            .map(|(lh, f)| lh * f)
            .sum()
    }

    /// Every slot has one owner and every computed branch holds a slot
    pub fn check_slot_invariant(&self) -> Result<()> {
        self.arena.check_invariant(&self.tree)?;
        for (b, &done) in self.computed.iter().enumerate() {
            let branch = BranchId(b);
            if done && self.arena.slot_of(branch).is_none() {
                return Err(PhyloError::consistency(format!(
                    "branch {b} is marked computed but holds no slot"
                )));
            }
        }
        Ok(())
    }

    // ---- checkpoint ----------------------------------------------------

    pub fn save_checkpoint(&self, checkpoint: &mut Checkpoint) {
        self.rates.save_checkpoint(checkpoint);
    }

    /// Restore rate parameters; caches are invalidated as for `set_site_rates`
    pub fn restore_checkpoint(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        let mut rates = self.rates.clone();
        rates.restore_checkpoint(checkpoint)?;
        debug!(rates = ?rates.rates(), weights = ?rates.weights(), "restored rate parameters");
        self.set_site_rates(rates);
        Ok(())
    }

    /// Leaf node of a taxon
    pub fn leaf(&self, name: &str) -> Option<NodeId> {
        self.tree.taxa().iter().position(|t| t == name)
    }
}

/// Scale counts of two subtrees; running out of counter range is an error
#[inline]
pub(crate) fn add_scale_counts(a: u16, b: u16) -> Result<u16> {
    a.checked_add(b)
        .ok_or_else(|| PhyloError::consistency("per-pattern scale counter overflowed"))
}

fn check_model(model: &dyn SubstitutionModel, patterns: &PatternSet) -> Result<()> {
    if !model.is_reversible() {
        return Err(PhyloError::UnsupportedModel(format!(
            "model '{}' is not time-reversible",
            model.name()
        )));
    }
    if model.n_states() != patterns.n_states() {
        return Err(PhyloError::UnsupportedModel(format!(
            "model '{}' has {} states but the alignment has {}",
            model.name(),
            model.n_states(),
            patterns.n_states()
        )));
    }
    Ok(())
}
