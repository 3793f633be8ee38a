/// Free-rate model (+Rk) and its optimizers
///
/// k categories with free weights and rates, subject to Σw = 1 and
/// Σw·r = 1. Optimization works on ratios to the last category, which
/// removes the sum constraint from the search space:
///
/// - weights: v_i = w_i / w_k, so w_k = 1 / (1 + Σv) and w_i = v_i w_k
/// - rates:   v_i = r_i / r_k, rescaled afterwards to mean one
///
/// Two strategies are available: coordinate passes over weights and rates
/// in a configured order, or expectation-maximization where each category's
/// rate is fitted on a single-rate copy of the engine.

use ndarray::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::config::FreeRateSchedule;
use crate::error::{PhyloError, Result};
use crate::likelihood::LikelihoodEngine;
use crate::optimize::coordinate_maximize;
use crate::rates::{discrete_gamma_rates, DiscreteGamma, RateHeterogeneity, SiteRates, MAX_GAMMA_SHAPE, MIN_GAMMA_SHAPE};

pub const MIN_FREE_RATE: f64 = 0.001;
pub const MAX_FREE_RATE: f64 = 1000.0;
pub const MIN_FREE_RATE_PROP: f64 = 0.001;
pub const MAX_FREE_RATE_PROP: f64 = 1000.0;

/// Lower bound of a category rate in the EM tree-scaling search
const MIN_EM_SCALING: f64 = 1e-4;

/// Which parameters an optimizer vector carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    Rates,
    Weights,
    /// Weight ratios followed by rate ratios
    Joint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreeRate {
    rates: Vec<f64>,
    weights: Vec<f64>,
    fixed: bool,
}

impl FreeRate {
    /// Rates of a discrete gamma with `shape`, equal weights
    pub fn from_gamma(n_categories: usize, shape: f64) -> Result<Self> {
        if n_categories < 1 {
            return Err(PhyloError::invalid("n_categories", "need at least one category"));
        }
        Ok(Self {
            rates: discrete_gamma_rates(shape, n_categories, false)?,
            weights: vec![1.0 / n_categories as f64; n_categories],
            fixed: false,
        })
    }

    /// User-fixed parameters `w1, r1, w2, r2, ...`; rates are rescaled to mean one
    pub fn from_params(params: &[f64]) -> Result<Self> {
        if params.is_empty() || params.len() % 2 != 0 {
            return Err(PhyloError::invalid("params", "expected weight/rate pairs"));
        }
        let weights: Vec<f64> = params.iter().step_by(2).copied().collect();
        let rates: Vec<f64> = params.iter().skip(1).step_by(2).copied().collect();
        if weights.iter().chain(&rates).any(|v| !(*v > 0.0) || !v.is_finite()) {
            return Err(PhyloError::invalid("params", "weights and rates must be positive"));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-4 {
            return Err(PhyloError::invalid("params", format!("weights sum to {total}, not 1")));
        }
        let mut model = Self {
            weights: weights.iter().map(|w| w / total).collect(),
            rates,
            fixed: true,
        };
        model.normalize();
        Ok(model)
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Weights must be positive and sum to one; rates are left untouched
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(PhyloError::invalid("weights", format!("expected {} values", self.weights.len())));
        }
        if weights.iter().any(|w| !(*w > 0.0)) || (weights.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(PhyloError::invalid("weights", "must be positive and sum to 1"));
        }
        self.weights.copy_from_slice(weights);
        Ok(())
    }

    pub fn set_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.rates.len() {
            return Err(PhyloError::invalid("rates", format!("expected {} values", self.rates.len())));
        }
        if rates.iter().any(|r| !(*r > 0.0) || !r.is_finite()) {
            return Err(PhyloError::invalid("rates", "must be positive"));
        }
        self.rates.copy_from_slice(rates);
        Ok(())
    }

    /// Divide rates by their weighted mean; returns the old mean
    pub fn normalize(&mut self) -> f64 {
        let mean = self.mean_rate();
        for r in &mut self.rates {
            *r /= mean;
        }
        mean
    }

    /// Order categories by increasing rate
    pub fn sort_by_rate(&mut self) {
        let mut pairs: Vec<(f64, f64)> = self.rates.iter().copied().zip(self.weights.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (k, (r, w)) in pairs.into_iter().enumerate() {
            self.rates[k] = r;
            self.weights[k] = w;
        }
    }

    /// Length of the optimizer vector for `mode`
    pub fn n_dimensions(&self, mode: ParameterMode) -> usize {
        if self.fixed {
            return 0;
        }
        let k = self.rates.len() - 1;
        match mode {
            ParameterMode::Rates | ParameterMode::Weights => k,
            ParameterMode::Joint => 2 * k,
        }
    }

    /// Lower and upper bounds of each optimizer variable
    pub fn bounds(&self, mode: ParameterMode) -> (Vec<f64>, Vec<f64>) {
        let k = self.rates.len() - 1;
        let (mut lower, mut upper) = (Vec::new(), Vec::new());
        if matches!(mode, ParameterMode::Weights | ParameterMode::Joint) {
            lower.extend(std::iter::repeat(MIN_FREE_RATE_PROP).take(k));
            upper.extend(std::iter::repeat(MAX_FREE_RATE_PROP).take(k));
        }
        if matches!(mode, ParameterMode::Rates | ParameterMode::Joint) {
            lower.extend(std::iter::repeat(MIN_FREE_RATE).take(k));
            upper.extend(std::iter::repeat(MAX_FREE_RATE).take(k));
        }
        (lower, upper)
    }

    /// Write the current parameters into an optimizer vector
    pub fn set_variables(&self, mode: ParameterMode, variables: &mut [f64]) {
        let k = self.rates.len() - 1;
        let mut pos = 0;
        if matches!(mode, ParameterMode::Weights | ParameterMode::Joint) {
            for i in 0..k {
                variables[pos + i] = self.weights[i] / self.weights[k];
            }
            pos += k;
        }
        if matches!(mode, ParameterMode::Rates | ParameterMode::Joint) {
            for i in 0..k {
                variables[pos + i] = self.rates[i] / self.rates[k];
            }
        }
    }

    /// Read parameters back from an optimizer vector, clamping to the bounds
    ///
    /// Returns whether any weight or rate changed.
    pub fn get_variables(&mut self, mode: ParameterMode, variables: &[f64]) -> bool {
        let k = self.rates.len() - 1;
        let old_weights = self.weights.clone();
        let old_rates = self.rates.clone();
        let mut pos = 0;

        if matches!(mode, ParameterMode::Weights | ParameterMode::Joint) {
            let ratios: Vec<f64> = variables[pos..pos + k]
                .iter()
                .map(|v| v.clamp(MIN_FREE_RATE_PROP, MAX_FREE_RATE_PROP))
                .collect();
            let last = 1.0 / (1.0 + ratios.iter().sum::<f64>());
            for (w, v) in self.weights.iter_mut().zip(&ratios) {
                *w = v * last;
            }
            self.weights[k] = last;
            pos += k;
        }
        if matches!(mode, ParameterMode::Rates | ParameterMode::Joint) {
            for i in 0..k {
                self.rates[i] = variables[pos + i].clamp(MIN_FREE_RATE, MAX_FREE_RATE);
            }
            self.rates[k] = 1.0;
            self.normalize();
        }

        self.weights != old_weights || self.rates != old_rates
    }

    /// Model with one more category: the heaviest one is split in two
    ///
    /// The halves get rates 0.586 r and 1.414 r and half the weight each,
    /// which keeps the mean rate.
    pub fn split_category(&self) -> FreeRate {
        let heaviest = self
            .weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        let mut rates = Vec::with_capacity(self.rates.len() + 1);
        let mut weights = Vec::with_capacity(self.rates.len() + 1);
        for (i, (&r, &w)) in self.rates.iter().zip(&self.weights).enumerate() {
            if i == heaviest {
                rates.extend([0.586 * r, 1.414 * r]);
                weights.extend([0.5 * w, 0.5 * w]);
            } else {
                rates.push(r);
                weights.push(w);
            }
        }
        let mut model = FreeRate {
            rates,
            weights,
            fixed: false,
        };
        model.sort_by_rate();
        model
    }

    /// Name with parameters, e.g. `+R2{0.3,0.2,0.7,1.34}`
    pub fn name_params(&self) -> String {
        let params: Vec<String> = self
            .weights
            .iter()
            .zip(&self.rates)
            .map(|(w, r)| format!("{},{}", round4(*w), round4(*r)))
            .collect();
        format!("{}{{{}}}", self.name(), params.join(","))
    }
}

fn round4(x: f64) -> f64 {
    (x * 1e4).round() / 1e4
}

impl RateHeterogeneity for FreeRate {
    fn rates(&self) -> &[f64] {
        &self.rates
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn name(&self) -> String {
        format!("+R{}", self.rates.len())
    }

    fn n_free_parameters(&self) -> usize {
        self.n_dimensions(ParameterMode::Joint)
    }

    fn save_checkpoint(&self, checkpoint: &mut Checkpoint) {
        checkpoint.start_struct("RateFree");
        checkpoint.put_array("prop", &self.weights);
        checkpoint.put_array("rates", &self.rates);
        checkpoint.end_struct();
    }

    fn restore_checkpoint(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.start_struct("RateFree");
        let weights = checkpoint.get_array("prop", self.weights.len());
        let rates = checkpoint.get_array("rates", self.rates.len());
        checkpoint.end_struct();
        // Validate everything before touching the live model
        let mut restored = self.clone();
        if let Some(weights) = weights? {
            restored.set_weights(&weights)?;
        }
        if let Some(rates) = rates? {
            restored.set_rates(&rates)?;
        }
        restored.normalize();
        *self = restored;
        Ok(())
    }
}

/// Trace of an EM run
#[derive(Debug, Clone, PartialEq)]
pub struct EmReport {
    /// Log-likelihood before the first iteration and after every accepted one
    pub log_likelihoods: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl LikelihoodEngine {
    /// Optimize the rate-heterogeneity parameters; returns the log-likelihood
    ///
    /// Free-rate models follow the configured pass schedule, a discrete gamma
    /// has its shape optimized, other models are left as they are.
    #[instrument(skip(self))]
    pub fn optimize_rate_parameters(&mut self, epsilon: f64) -> Result<f64> {
        let tolerance = epsilon.max(1e-4);
        if matches!(self.rates, SiteRates::Gamma(_)) {
            return self.optimize_gamma_shape(tolerance);
        }
        if !self.rates.as_free().is_some_and(|free| !free.is_fixed()) {
            return self.compute_likelihood();
        }

        let schedule = match self.config.free_rate.schedule {
            FreeRateSchedule::Em if self.patterns.has_ascertainment() => {
                warn!("EM is not available with ascertainment correction, optimizing weights then rates");
                FreeRateSchedule::WeightsThenRates
            }
            schedule => schedule,
        };
        let log_likelihood = match schedule {
            FreeRateSchedule::Em => {
                let report = self.optimize_with_em()?;
                report.log_likelihoods.last().copied().unwrap_or(f64::NEG_INFINITY)
            }
            FreeRateSchedule::WeightsThenRates => {
                self.optimize_free_rate_pass(ParameterMode::Weights, tolerance)?;
                self.optimize_free_rate_pass(ParameterMode::Rates, tolerance)?
            }
            FreeRateSchedule::RatesThenWeights => {
                self.optimize_free_rate_pass(ParameterMode::Rates, tolerance)?;
                self.optimize_free_rate_pass(ParameterMode::Weights, tolerance)?
            }
            FreeRateSchedule::Joint => self.optimize_free_rate_pass(ParameterMode::Joint, tolerance)?,
        };
        if let Some(free) = self.rates.as_free() {
            info!(model = %free.name_params(), log_likelihood, "optimized free-rate parameters");
        }
        Ok(log_likelihood)
    }

    /// Alternate rate-parameter and branch-length optimization until a round
    /// gains less than `epsilon`; returns the log-likelihood
    ///
    /// Branch sweeps use `branch.max_sweeps` and `branch.sweep_tolerance`.
    #[instrument(skip(self))]
    pub fn optimize_model_parameters(&mut self, epsilon: f64, max_rounds: usize) -> Result<f64> {
        let (max_sweeps, sweep_tolerance) = (self.config.branch.max_sweeps, self.config.branch.sweep_tolerance);
        let mut log_likelihood = self.compute_likelihood()?;
        for round in 0..max_rounds {
            let start = log_likelihood;
            self.optimize_rate_parameters(epsilon)?;
            log_likelihood = self.optimize_all_branches(max_sweeps, sweep_tolerance)?;
            debug!(round, log_likelihood, "model optimization round");
            if log_likelihood - start < epsilon {
                break;
            }
        }
        info!(log_likelihood, "optimized model parameters");
        Ok(log_likelihood)
    }

    fn optimize_free_rate_pass(&mut self, mode: ParameterMode, tolerance: f64) -> Result<f64> {
        let template = self
            .rates
            .as_free()
            .cloned()
            .ok_or_else(|| PhyloError::invalid("site_rates", "not a free-rate model"))?;
        let mut variables = vec![0.0; template.n_dimensions(mode)];
        template.set_variables(mode, &mut variables);
        let (lower, upper) = template.bounds(mode);

        coordinate_maximize(
            |vars| {
                let mut trial = template.clone();
                trial.get_variables(mode, vars);
                self.set_site_rates(SiteRates::Free(trial));
                self.compute_likelihood()
            },
            &mut variables,
            &lower,
            &upper,
            tolerance,
            100,
        )?;

        let mut best = template;
        best.get_variables(mode, &variables);
        let log_likelihood = self.apply_free_rate(best)?;
        debug!(?mode, log_likelihood, "free-rate pass");
        Ok(log_likelihood)
    }

    /// Install a free-rate model with mean rate one; branch lengths absorb the old mean
    fn apply_free_rate(&mut self, mut model: FreeRate) -> Result<f64> {
        let mean = model.normalize();
        if self.config.free_rate.sorted {
            model.sort_by_rate();
        }
        self.set_site_rates(SiteRates::Free(model));
        if (mean - 1.0).abs() > 1e-12 {
            self.scale_branch_lengths(mean);
        }
        self.compute_likelihood()
    }

    fn optimize_gamma_shape(&mut self, tolerance: f64) -> Result<f64> {
        let SiteRates::Gamma(gamma) = &self.rates else {
            return Err(PhyloError::invalid("site_rates", "not a gamma model"));
        };
        let template: DiscreteGamma = gamma.clone();
        let mut shape = [template.shape()];
        coordinate_maximize(
            |x| {
                let mut trial = template.clone();
                trial.set_shape(x[0])?;
                self.set_site_rates(SiteRates::Gamma(trial));
                self.compute_likelihood()
            },
            &mut shape,
            &[MIN_GAMMA_SHAPE],
            &[MAX_GAMMA_SHAPE],
            tolerance,
            1,
        )?;
        let mut best = template;
        best.set_shape(shape[0])?;
        self.set_site_rates(SiteRates::Gamma(best));
        let log_likelihood = self.compute_likelihood()?;
        debug!(shape = shape[0], log_likelihood, "optimized gamma shape");
        Ok(log_likelihood)
    }

    /// Expectation-maximization of free-rate weights and rates
    ///
    /// E-step: posterior category weights per pattern. M-step: new weights
    /// are the posterior means (floored at `min_em_weight`), and each rate is
    /// fitted by scaling the tree of a single-rate copy of this engine whose
    /// pattern weights are that category's posteriors. An iteration that
    /// lowers the likelihood is undone and ends the run.
    #[instrument(skip(self))]
    pub fn optimize_with_em(&mut self) -> Result<EmReport> {
        let cfg = self.config.free_rate.clone();
        let fixed = match self.rates.as_free() {
            Some(free) => free.is_fixed(),
            None => return Err(PhyloError::invalid("site_rates", "EM needs a free-rate model")),
        };
        let start = self.compute_likelihood()?;
        if fixed {
            return Ok(EmReport {
                log_likelihoods: vec![start],
                iterations: 0,
                converged: true,
            });
        }
        if self.patterns.has_ascertainment() {
            warn!("EM is not available with ascertainment correction, optimizing weights then rates");
            let tolerance = cfg.em_tolerance.max(1e-4);
            self.optimize_free_rate_pass(ParameterMode::Weights, tolerance)?;
            let end = self.optimize_free_rate_pass(ParameterMode::Rates, tolerance)?;
            return Ok(EmReport {
                log_likelihoods: vec![start, end],
                iterations: 0,
                converged: false,
            });
        }

        let mut log_likelihood = start;
        let mut history = vec![start];
        let mut converged = false;
        let mut iterations = 0;

        for iteration in 0..cfg.em_max_iterations {
            iterations = iteration + 1;
            let current = self
                .rates
                .as_free()
                .cloned()
                .ok_or_else(|| PhyloError::consistency("rate model changed during EM"))?;
            let saved_lengths = self.tree.branch_lengths();

            let posterior = self.em_posterior()?;
            let weights = floor_weights(
                posterior.sum_axis(Axis(0)).iter().map(|s| s / self.n_sites).collect(),
                cfg.min_em_weight,
            );

            let mut rates = current.rates().to_vec();
            for (cat, rate) in rates.iter_mut().enumerate() {
                let mut sub = self.category_engine(posterior.column(cat).to_vec())?;
                let (scaling, _) = sub.optimize_tree_length_scaling(
                    MIN_EM_SCALING,
                    *rate,
                    1.0 / weights[cat],
                    cfg.em_scaling_tolerance,
                )?;
                *rate = scaling;
            }

            let mut next = current.clone();
            next.set_weights(&weights)?;
            next.set_rates(&rates)?;
            let new_log_likelihood = self.apply_free_rate(next)?;

            if new_log_likelihood < log_likelihood - cfg.em_tolerance {
                warn!(
                    iteration,
                    log_likelihood,
                    new_log_likelihood,
                    "EM step lowered the log-likelihood, rolling back"
                );
                self.set_site_rates(SiteRates::Free(current));
                self.set_branch_lengths(&saved_lengths)?;
                self.compute_likelihood()?;
                break;
            }
            debug!(iteration, log_likelihood = new_log_likelihood, "EM iteration");
            history.push(new_log_likelihood);
            log_likelihood = new_log_likelihood;

            let updated = self
                .rates
                .as_free()
                .ok_or_else(|| PhyloError::consistency("rate model changed during EM"))?;
            let change = updated
                .weights()
                .iter()
                .zip(current.weights())
                .chain(updated.rates().iter().zip(current.rates()))
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            if change < cfg.em_tolerance {
                converged = true;
                break;
            }
        }

        Ok(EmReport {
            log_likelihoods: history,
            iterations,
            converged,
        })
    }

    /// Posterior weight of every (pattern, category), scaled by the pattern frequency
    fn em_posterior(&mut self) -> Result<Array2<f64>> {
        let mut posterior = self.compute_pattern_lh_cat()?;
        for (ptn, mut row) in posterior.rows_mut().into_iter().enumerate() {
            let total = row.sum();
            if !(total > 0.0) || !total.is_finite() {
                return Err(PhyloError::consistency(format!(
                    "pattern {} has likelihood {total} in the E-step",
                    ptn + 1
                )));
            }
            let factor = self.ptn_freq[ptn] / total;
            row.mapv_inplace(|v| v * factor);
        }
        Ok(posterior)
    }

    /// Single-rate copy of this engine with the given pattern weights
    fn category_engine(&self, frequencies: Vec<f64>) -> Result<LikelihoodEngine> {
        let mut sub = LikelihoodEngine::with_pool(
            self.tree.clone(),
            self.patterns.clone(),
            self.model.clone(),
            SiteRates::default(),
            self.config.clone(),
            self.pool.clone(),
        )?;
        sub.set_kernel(self.kernel);
        sub.set_current_edge(self.current_edge)?;
        sub.set_pattern_frequencies(&frequencies)?;
        Ok(sub)
    }

    /// Split the heaviest free-rate category and return the new log-likelihood
    pub fn split_rate_category(&mut self) -> Result<f64> {
        let next = self
            .rates
            .as_free()
            .map(FreeRate::split_category)
            .ok_or_else(|| PhyloError::invalid("site_rates", "not a free-rate model"))?;
        self.set_site_rates(SiteRates::Free(next));
        self.compute_likelihood()
    }
}

/// Raise every weight to at least `floor`, taking the difference from the largest weight
fn floor_weights(mut weights: Vec<f64>, floor: f64) -> Vec<f64> {
    for cat in 0..weights.len() {
        if weights[cat] >= floor {
            continue;
        }
        let deficit = floor - weights[cat];
        let largest = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        weights[largest] -= deficit;
        weights[cat] = floor;
    }
    let total: f64 = weights.iter().sum();
    weights.iter().map(|w| w / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    #[test]
    fn test_from_gamma_is_normalized() {
        let model = FreeRate::from_gamma(4, 1.0).unwrap();
        assert_abs_diff_eq!(model.mean_rate(), 1.0, epsilon = 1e-10);
        assert_eq!(model.name(), "+R4");
        assert_eq!(model.n_free_parameters(), 6);
    }

    #[test]
    fn test_fixed_params() {
        let model = FreeRate::from_params(&[0.3, 0.2, 0.7, 2.0]).unwrap();
        assert!(model.is_fixed());
        assert_eq!(model.n_free_parameters(), 0);
        assert_abs_diff_eq!(model.mean_rate(), 1.0, epsilon = 1e-12);
        assert!(FreeRate::from_params(&[0.3, 0.2, 0.6, 2.0]).is_err());
    }

    #[rstest]
    #[case(ParameterMode::Weights)]
    #[case(ParameterMode::Rates)]
    #[case(ParameterMode::Joint)]
    fn test_variables_round_trip(#[case] mode: ParameterMode) {
        let mut model = FreeRate::from_params(&[0.2, 0.1, 0.5, 0.8, 0.3, 2.0]).unwrap();
        model.set_fixed(false);
        let mut vars = vec![0.0; model.n_dimensions(mode)];
        model.set_variables(mode, &mut vars);
        let before = model.clone();
        model.get_variables(mode, &vars);
        for (a, b) in model.weights().iter().zip(before.weights()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        for (a, b) in model.rates().iter().zip(before.rates()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_get_variables_clamps_and_reports_change() {
        let mut model = FreeRate::from_gamma(3, 1.0).unwrap();
        assert!(model.get_variables(ParameterMode::Weights, &[1e-9, 5000.0]));
        let w = model.weights();
        assert_abs_diff_eq!(w[0] / w[2], MIN_FREE_RATE_PROP, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1] / w[2], MAX_FREE_RATE_PROP, epsilon = 1e-9);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rates_mode_keeps_mean_one() {
        let mut model = FreeRate::from_gamma(3, 0.5).unwrap();
        model.get_variables(ParameterMode::Rates, &[0.05, 0.4]);
        assert_abs_diff_eq!(model.mean_rate(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.rates()[0] / model.rates()[2], 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_split_category_keeps_mean() {
        let model = FreeRate::from_params(&[0.6, 0.5, 0.4, 1.75]).unwrap();
        let split = model.split_category();
        assert_eq!(split.n_categories(), 3);
        assert_abs_diff_eq!(split.mean_rate(), model.mean_rate(), epsilon = 1e-12);
        assert_abs_diff_eq!(split.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(split.rates().windows(2).all(|w| w[0] <= w[1]));
        assert!(!split.is_fixed());
    }

    #[test]
    fn test_name_params() {
        let model = FreeRate::from_params(&[0.25, 0.5, 0.75, 7.0 / 6.0]).unwrap();
        assert_eq!(model.name_params(), "+R2{0.25,0.5,0.75,1.1667}");
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let model = FreeRate::from_params(&[0.25, 0.5, 0.75, 7.0 / 6.0]).unwrap();
        let mut ckp = Checkpoint::new();
        model.save_checkpoint(&mut ckp);
        assert!(ckp.has_key("RateFree.prop"));
        assert!(ckp.has_key("RateFree.rates"));

        let mut restored = FreeRate::from_gamma(2, 1.0).unwrap();
        restored.restore_checkpoint(&mut ckp).unwrap();
        assert_eq!(restored.weights(), model.weights());
        for (a, b) in restored.rates().iter().zip(model.rates()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_restore_rejects_invalid_weights() {
        let mut ckp = Checkpoint::new();
        ckp.start_struct("RateFree");
        ckp.put_array("prop", &[0.7, 0.7]);
        ckp.put_array("rates", &[0.5, 1.5]);
        ckp.end_struct();

        let mut model = FreeRate::from_gamma(2, 1.0).unwrap();
        let before = model.clone();
        assert!(model.restore_checkpoint(&mut ckp).is_err());
        assert_eq!(model, before);
    }

    #[test]
    fn test_restore_normalizes_rates() {
        let mut ckp = Checkpoint::new();
        ckp.start_struct("RateFree");
        ckp.put_array("prop", &[0.5, 0.5]);
        ckp.put_array("rates", &[1.0, 3.0]);
        ckp.end_struct();

        let mut model = FreeRate::from_gamma(2, 1.0).unwrap();
        model.restore_checkpoint(&mut ckp).unwrap();
        assert_abs_diff_eq!(model.mean_rate(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.rates()[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.rates()[1], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_floor_weights_takes_from_largest() {
        let w = floor_weights(vec![0.7, 0.29995, 0.00005], 1e-4);
        assert_abs_diff_eq!(w[2], 1e-4, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 0.7 - 5e-5, epsilon = 1e-12);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
}
