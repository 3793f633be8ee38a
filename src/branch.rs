/// Branch-length optimization on a buffered edge
///
/// For the edge being optimized the engine keeps θ = A ⊙ B, the product of
/// the eigen-basis partials on both sides. The likelihood and its first two
/// derivatives in the branch length t are then plain dot products:
///
///   L   = Σ θ · val0,   val0[c][i] = w_c exp(λ_i r_c t)
///   L'  = Σ θ · val1,   val1 = λ_i r_c · val0
///   L'' = Σ θ · val2,   val2 = λ_i r_c · val1
///
/// so every Newton-Raphson step costs one pass over θ and no pruning.

use rayon::prelude::*;
use tracing::{debug, instrument, warn};

use crate::arena::{aligned_zeros, AlignedBuf};
use crate::error::{PhyloError, Result};
use crate::likelihood::{add_scale_counts, LikelihoodEngine, LOG_SCALING_THRESHOLD};
use crate::optimize::{brent_maximize, newton_raphson};
use crate::rates::RateHeterogeneity;
use crate::tree::{BranchId, EdgeId, NodeId};

/// θ for one edge plus the summed scale counts of both sides
pub(crate) struct ThetaBuffer {
    /// Edge the buffer was built for; `None` when stale
    pub(crate) edge: Option<EdgeId>,
    /// Layout `[pattern][category][state]`
    pub(crate) lh: AlignedBuf,
    pub(crate) scale_num: Vec<u16>,
    /// Σ of both sides' branch scale factors
    pub(crate) scale_total: f64,
}

impl ThetaBuffer {
    pub(crate) fn new(len: usize, n_patterns: usize) -> Self {
        Self {
            edge: None,
            lh: aligned_zeros(len),
            scale_num: vec![0; n_patterns],
            scale_total: 0.0,
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.edge = None;
    }
}

/// Log-likelihood terms of the unobservable patterns
///
/// With P the total probability of the unobservable patterns and N sites,
/// the conditioned log-likelihood adds −N ln(1 − P) and its derivatives add
/// N P'/(1 − P) and N (P''/(1 − P) + (P'/(1 − P))²).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AscertainmentTerms {
    pub(crate) log_term: f64,
    pub(crate) df: f64,
    pub(crate) ddf: f64,
}

/// The single place the correction is computed, for plain and derivative evaluations alike
pub(crate) fn ascertainment_terms(n_sites: f64, mass: f64, d_mass: f64, dd_mass: f64) -> Result<AscertainmentTerms> {
    let mass = mass.max(0.0);
    if !(mass < 1.0) {
        return Err(PhyloError::consistency(format!(
            "probability of unobservable patterns is {mass}"
        )));
    }
    let rest = 1.0 - mass;
    let ratio = d_mass / rest;
    Ok(AscertainmentTerms {
        log_term: -n_sites * rest.ln(),
        df: n_sites * ratio,
        ddf: n_sites * (dd_mass / rest + ratio * ratio),
    })
}

/// Result of one buffer evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchEvaluation {
    pub log_likelihood: f64,
    pub df: f64,
    pub ddf: f64,
}

impl LikelihoodEngine {
    /// Build θ for `edge` unless the buffer already holds it
    pub(crate) fn compute_theta(&mut self, edge: EdgeId) -> Result<()> {
        if self.theta.edge == Some(edge) {
            return Ok(());
        }
        let down = BranchId::new(edge, false);
        let up = down.reverse();
        self.compute_partial_likelihood(down)?;
        self.compute_partial_likelihood(up)?;

        let mut theta = std::mem::replace(&mut self.theta, ThetaBuffer::new(0, 0));
        let filled = self.fill_theta(down, up, &mut theta);
        self.theta = theta;
        self.theta.scale_total = filled?;
        self.theta.edge = Some(edge);
        self.stats.theta_builds += 1;
        Ok(())
    }

    fn fill_theta(&self, down: BranchId, up: BranchId, theta: &mut ThetaBuffer) -> Result<f64> {
        let below = self.side(down)?;
        let above = self.side(up)?;
        let n = self.n_states();
        let n_cat = self.n_categories();
        let block = self.block();
        let kernel = self.kernel;
        let min_len = self.min_chunk();

        let ThetaBuffer { lh, scale_num, .. } = theta;
        self.pool.install(|| {
            lh.par_chunks_mut(block)
                .zip(scale_num.par_iter_mut())
                .enumerate()
                .with_min_len(min_len)
                .try_for_each(|(ptn, (dst, count))| -> Result<()> {
                    for cat in 0..n_cat {
                        kernel.mul_into(
                            &mut dst[cat * n..(cat + 1) * n],
                            below.category(ptn, cat),
                            above.category(ptn, cat),
                        );
                    }
                    *count = add_scale_counts(below.scale_count(ptn), above.scale_count(ptn))?;
                    Ok(())
                })
        })?;
        Ok(self.branch_scale_factor(down) + self.branch_scale_factor(up))
    }

    /// Evaluate the buffered edge at `length` without touching partials
    pub(crate) fn evaluate_buffer(&mut self, length: f64, derivatives: bool) -> Result<BranchEvaluation> {
        if self.theta.edge.is_none() {
            return Err(PhyloError::consistency("no edge is buffered"));
        }
        let n_obs = self.patterns.n_patterns();
        let n_total = self.patterns.n_total_patterns();
        let block = self.block();

        let mut val0 = Vec::with_capacity(block);
        let mut val1 = Vec::with_capacity(block);
        let mut val2 = Vec::with_capacity(block);
        for (&rate, &weight) in self.rates.rates().iter().zip(self.rates.weights()) {
            for &lambda in &self.eigen.lambda {
                let lr = lambda * rate;
                let v = weight * (lr * length).exp();
                val0.push(v);
                val1.push(lr * v);
                val2.push(lr * lr * v);
            }
        }

        let kernel = self.kernel;
        let theta = &self.theta.lh[..n_total * block];
        let mut raw = vec![(0.0, 0.0, 0.0); n_total];
        let min_len = self.min_chunk();
        self.pool.install(|| {
            raw.par_iter_mut()
                .zip(theta.par_chunks(block))
                .with_min_len(min_len)
                .for_each(|(out, th)| {
                    *out = if derivatives {
                        kernel.dot3(th, &val0, &val1, &val2)
                    } else {
                        (kernel.dot(th, &val0), 0.0, 0.0)
                    };
                });
        });

        let mut sum_log = 0.0;
        let mut df = 0.0;
        let mut ddf = 0.0;
        for ptn in 0..n_obs {
            let (lh, d1, d2) = raw[ptn];
            let freq = self.ptn_freq[ptn];
            let log_lh = lh.ln();
            self.pattern_lh[ptn] = log_lh + f64::from(self.theta.scale_num[ptn]) * LOG_SCALING_THRESHOLD;
            sum_log += freq * log_lh;
            if derivatives {
                let r1 = d1 / lh;
                df += freq * r1;
                ddf += freq * (d2 / lh - r1 * r1);
            }
        }
        let mut log_likelihood = sum_log + self.theta.scale_total;

        if self.patterns.has_ascertainment() {
            let (mut mass, mut d_mass, mut dd_mass) = (0.0, 0.0, 0.0);
            for ptn in n_obs..n_total {
                let (lh, d1, d2) = raw[ptn];
                let scale = (f64::from(self.theta.scale_num[ptn]) * LOG_SCALING_THRESHOLD).exp();
                mass += lh * scale;
                d_mass += d1 * scale;
                dd_mass += d2 * scale;
            }
            let asc = ascertainment_terms(self.n_sites, mass, d_mass, dd_mass)?;
            self.asc_mass = mass;
            log_likelihood += asc.log_term;
            df += asc.df;
            ddf += asc.ddf;
            let shift = -(1.0 - mass.max(0.0)).ln();
            for lh in &mut self.pattern_lh {
                *lh += shift;
            }
        }

        if !log_likelihood.is_finite() {
            log_likelihood = self.floor_non_finite();
        }
        self.stats.buffer_evaluations += 1;
        Ok(BranchEvaluation {
            log_likelihood,
            df,
            ddf,
        })
    }

    /// Re-evaluate the buffered edge at its current length
    pub fn compute_likelihood_from_buffer(&mut self) -> Result<f64> {
        let edge = self
            .theta
            .edge
            .ok_or_else(|| PhyloError::consistency("no edge is buffered"))?;
        let length = self.tree.branch_length(edge);
        Ok(self.evaluate_buffer(length, false)?.log_likelihood)
    }

    /// Log-likelihood and its first and second derivative in the length of `edge`
    pub fn compute_likelihood_derv(&mut self, edge: EdgeId) -> Result<BranchEvaluation> {
        if edge >= self.tree.n_edges() {
            return Err(PhyloError::invalid("edge", format!("no edge {edge}")));
        }
        self.current_edge = edge;
        self.compute_theta(edge)?;
        let length = self.tree.branch_length(edge);
        self.evaluate_buffer(length, true)
    }

    /// Maximize the likelihood over the length of the edge joining `node1` and `node2`
    ///
    /// The new length is kept only if it scores at least as well as the old one.
    pub fn optimize_one_branch(&mut self, node1: NodeId, node2: NodeId) -> Result<f64> {
        let edge = self.tree.edge_between(node1, node2).ok_or_else(|| {
            PhyloError::invalid("node2", format!("nodes {node1} and {node2} are not adjacent"))
        })?;
        self.optimize_edge(edge)
    }

    pub(crate) fn optimize_edge(&mut self, edge: EdgeId) -> Result<f64> {
        self.current_edge = edge;
        self.compute_theta(edge)?;
        let start = self.tree.branch_length(edge);
        let cfg = self.config.branch.clone();

        let opt = newton_raphson(
            |t| {
                let e = self.evaluate_buffer(t, true)?;
                Ok((e.log_likelihood, e.df, e.ddf))
            },
            start,
            cfg.min_length,
            cfg.max_length,
            cfg.tolerance,
            cfg.max_newton_steps,
        )?;

        if opt.x != start {
            self.set_branch_length(edge, opt.x)?;
        }
        let log_likelihood = self.compute_likelihood_from_buffer()?;
        debug!(edge, start, length = opt.x, log_likelihood, steps = opt.evaluations, "optimized branch");
        Ok(log_likelihood)
    }

    /// Depth-first sweeps over every edge until a sweep gains less than `tolerance`
    ///
    /// A sweep that lowers the likelihood is undone and ends the loop.
    #[instrument(skip(self))]
    pub fn optimize_all_branches(&mut self, max_iterations: usize, tolerance: f64) -> Result<f64> {
        let mut log_likelihood = self.compute_likelihood()?;
        let order = self.tree.edges_postorder();
        for sweep in 0..max_iterations {
            let saved = self.tree.branch_lengths();
            let start = log_likelihood;
            for &edge in &order {
                log_likelihood = self.optimize_edge(edge)?;
            }
            if log_likelihood < start {
                warn!(sweep, start, log_likelihood, "branch sweep lowered the log-likelihood, rolling back");
                self.set_branch_lengths(&saved)?;
                log_likelihood = self.compute_likelihood()?;
                break;
            }
            debug!(sweep, log_likelihood, "branch sweep");
            if log_likelihood - start < tolerance {
                break;
            }
        }
        Ok(log_likelihood)
    }

    /// Brent search for a common multiplier of all branch lengths in `[min, max]`
    ///
    /// Returns the multiplier and the log-likelihood; lengths are left scaled.
    #[instrument(skip(self))]
    pub fn optimize_tree_length_scaling(
        &mut self,
        min_scaling: f64,
        scaling: f64,
        max_scaling: f64,
        tolerance: f64,
    ) -> Result<(f64, f64)> {
        let base = self.tree.branch_lengths();
        let mut scaled = base.clone();
        let opt = brent_maximize(
            |s| {
                for (dst, &len) in scaled.iter_mut().zip(&base) {
                    *dst = len * s;
                }
                self.set_branch_lengths(&scaled)?;
                self.compute_likelihood()
            },
            min_scaling,
            scaling,
            max_scaling,
            tolerance,
            100,
        )?;
        for (dst, &len) in scaled.iter_mut().zip(&base) {
            *dst = len * opt.x;
        }
        self.set_branch_lengths(&scaled)?;
        let log_likelihood = self.compute_likelihood()?;
        debug!(scaling = opt.x, log_likelihood, "tree length scaling");
        Ok((opt.x, log_likelihood))
    }
}
