/// Discrete rate heterogeneity across sites
///
/// A model is a set of (rate, weight) categories with Σ weight = 1 and
/// Σ weight·rate = 1, so branch lengths keep their meaning of expected
/// substitutions per site.

use statrs::distribution::{ContinuousCDF, Gamma};
use statrs::function::gamma::gamma_lr;

use crate::checkpoint::Checkpoint;
use crate::error::{PhyloError, Result};
use crate::freerate::FreeRate;

pub const MIN_GAMMA_SHAPE: f64 = 0.02;
pub const MAX_GAMMA_SHAPE: f64 = 1000.0;

pub trait RateHeterogeneity {
    fn rates(&self) -> &[f64];

    fn weights(&self) -> &[f64];

    /// Short model suffix such as `+G4`
    fn name(&self) -> String;

    fn n_categories(&self) -> usize {
        self.rates().len()
    }

    #[inline]
    fn rate(&self, category: usize) -> f64 {
        self.rates()[category]
    }

    #[inline]
    fn weight(&self, category: usize) -> f64 {
        self.weights()[category]
    }

    fn mean_rate(&self) -> f64 {
        self.rates().iter().zip(self.weights()).map(|(r, w)| r * w).sum()
    }

    /// Number of parameters the rate optimizer may change
    fn n_free_parameters(&self) -> usize {
        0
    }

    fn save_checkpoint(&self, _checkpoint: &mut Checkpoint) {}

    fn restore_checkpoint(&mut self, _checkpoint: &mut Checkpoint) -> Result<()> {
        Ok(())
    }
}

/// A single category of rate 1
#[derive(Clone, Debug)]
pub struct UniformRate {
    rates: [f64; 1],
    weights: [f64; 1],
}

impl Default for UniformRate {
    fn default() -> Self {
        Self {
            rates: [1.0],
            weights: [1.0],
        }
    }
}

impl RateHeterogeneity for UniformRate {
    fn rates(&self) -> &[f64] {
        &self.rates
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn name(&self) -> String {
        String::new()
    }
}

/// Yang (1994) discrete gamma with equal-weight categories
#[derive(Clone, Debug)]
pub struct DiscreteGamma {
    shape: f64,
    median: bool,
    rates: Vec<f64>,
    weights: Vec<f64>,
}

impl DiscreteGamma {
    /// Category rates are the means of each equal-probability slice
    pub fn new(n_categories: usize, shape: f64) -> Result<Self> {
        Self::build(n_categories, shape, false)
    }

    /// Category rates are the slice medians, rescaled to mean 1
    pub fn with_median(n_categories: usize, shape: f64) -> Result<Self> {
        Self::build(n_categories, shape, true)
    }

    fn build(n_categories: usize, shape: f64, median: bool) -> Result<Self> {
        if n_categories == 0 {
            return Err(PhyloError::invalid("n_categories", "need at least one category"));
        }
        let rates = discrete_gamma_rates(shape, n_categories, median)?;
        Ok(Self {
            shape,
            median,
            rates,
            weights: vec![1.0 / n_categories as f64; n_categories],
        })
    }

    pub fn shape(&self) -> f64 {
        self.shape
    }

    pub fn set_shape(&mut self, shape: f64) -> Result<()> {
        self.rates = discrete_gamma_rates(shape, self.rates.len(), self.median)?;
        self.shape = shape;
        Ok(())
    }
}

impl RateHeterogeneity for DiscreteGamma {
    fn rates(&self) -> &[f64] {
        &self.rates
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn name(&self) -> String {
        format!("+G{}", self.rates.len())
    }

    fn save_checkpoint(&self, checkpoint: &mut Checkpoint) {
        checkpoint.start_struct("RateGamma");
        checkpoint.put("gamma_shape", self.shape);
        checkpoint.end_struct();
    }

    fn restore_checkpoint(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.start_struct("RateGamma");
        let shape = checkpoint.get::<f64>("gamma_shape");
        checkpoint.end_struct();
        match shape? {
            Some(shape) => self.set_shape(shape),
            None => Ok(()),
        }
    }
}

/// Rates of a mean-one gamma cut into `n` equal-probability categories
pub fn discrete_gamma_rates(shape: f64, n: usize, median: bool) -> Result<Vec<f64>> {
    if !(MIN_GAMMA_SHAPE..=MAX_GAMMA_SHAPE).contains(&shape) {
        return Err(PhyloError::invalid(
            "gamma_shape",
            format!("must lie in [{MIN_GAMMA_SHAPE}, {MAX_GAMMA_SHAPE}], got {shape}"),
        ));
    }
    if n == 1 {
        return Ok(vec![1.0]);
    }
    let gamma = Gamma::new(shape, shape)
        .map_err(|e| PhyloError::invalid("gamma_shape", format!("{e:?}")))?;
    let k = n as f64;

    let mut rates: Vec<f64> = if median {
        (0..n)
            .map(|i| gamma.inverse_cdf((2.0 * i as f64 + 1.0) / (2.0 * k)))
            .collect()
    } else {
        // Mean of x over a slice of Gamma(a, a) is the Gamma(a + 1, a) mass of that slice
        let upper_mass: Vec<f64> = (1..n)
            .map(|i| gamma_lr(shape + 1.0, shape * gamma.inverse_cdf(i as f64 / k)))
            .chain(std::iter::once(1.0))
            .collect();
        let mut lower = 0.0;
        upper_mass
            .iter()
            .map(|&upper| {
                let rate = k * (upper - lower);
                lower = upper;
                rate
            })
            .collect()
    };

    let mean = rates.iter().sum::<f64>() / k;
    if !(mean > 0.0) || !mean.is_finite() {
        return Err(PhyloError::invalid(
            "gamma_shape",
            format!("degenerate category rates for shape {shape}"),
        ));
    }
    for r in &mut rates {
        *r /= mean;
    }
    Ok(rates)
}

/// The rate model an engine evaluates
#[derive(Clone, Debug)]
pub enum SiteRates {
    Uniform(UniformRate),
    Gamma(DiscreteGamma),
    Free(FreeRate),
}

impl Default for SiteRates {
    fn default() -> Self {
        SiteRates::Uniform(UniformRate::default())
    }
}

impl SiteRates {
    fn inner(&self) -> &dyn RateHeterogeneity {
        match self {
            SiteRates::Uniform(r) => r,
            SiteRates::Gamma(r) => r,
            SiteRates::Free(r) => r,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RateHeterogeneity {
        match self {
            SiteRates::Uniform(r) => r,
            SiteRates::Gamma(r) => r,
            SiteRates::Free(r) => r,
        }
    }

    pub fn as_free(&self) -> Option<&FreeRate> {
        match self {
            SiteRates::Free(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_free_mut(&mut self) -> Option<&mut FreeRate> {
        match self {
            SiteRates::Free(r) => Some(r),
            _ => None,
        }
    }
}

impl RateHeterogeneity for SiteRates {
    fn rates(&self) -> &[f64] {
        self.inner().rates()
    }

    fn weights(&self) -> &[f64] {
        self.inner().weights()
    }

    fn name(&self) -> String {
        self.inner().name()
    }

    fn n_free_parameters(&self) -> usize {
        self.inner().n_free_parameters()
    }

    fn save_checkpoint(&self, checkpoint: &mut Checkpoint) {
        self.inner().save_checkpoint(checkpoint)
    }

    fn restore_checkpoint(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.inner_mut().restore_checkpoint(checkpoint)
    }
}

impl From<DiscreteGamma> for SiteRates {
    fn from(r: DiscreteGamma) -> Self {
        SiteRates::Gamma(r)
    }
}

impl From<FreeRate> for SiteRates {
    fn from(r: FreeRate) -> Self {
        SiteRates::Free(r)
    }
}
