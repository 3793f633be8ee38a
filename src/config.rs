/// Engine and optimizer settings
///
/// Every struct deserializes with `#[serde(default)]`, so a JSON document only
/// needs to name the fields it overrides.

use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};

/// How partial-likelihood slots are assigned to directed branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// One slot per directed branch entering an internal node
    #[default]
    Full,
    /// One slot per internal node, moved between its three incoming branches
    PerNode,
}

/// Underflow rescaling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    /// Rescale a pattern block when its largest entry drops below 2^-256
    #[default]
    Auto,
    /// Never rescale; only safe for small trees
    Off,
}

/// Order of free-rate optimization passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FreeRateSchedule {
    /// Weights pass followed by a rates pass
    #[default]
    WeightsThenRates,
    RatesThenWeights,
    /// A single pass over weights and rates together
    Joint,
    /// Expectation-maximization (falls back to `WeightsThenRates` under ascertainment correction)
    Em,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchOptConfig {
    pub min_length: f64,
    pub max_length: f64,
    /// Newton-Raphson tolerance on the branch length
    pub tolerance: f64,
    pub max_newton_steps: usize,
    /// Sweeps per `optimize_all_branches` call inside `optimize_model_parameters`
    pub max_sweeps: usize,
    /// Log-likelihood improvement below which sweeps stop
    pub sweep_tolerance: f64,
}

impl Default for BranchOptConfig {
    fn default() -> Self {
        Self {
            min_length: 1e-6,
            max_length: 100.0,
            tolerance: 1e-6,
            max_newton_steps: 100,
            max_sweeps: 100,
            sweep_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeRateConfig {
    pub schedule: FreeRateSchedule,
    /// Keep categories in increasing rate order after every update
    pub sorted: bool,
    pub em_max_iterations: usize,
    /// Convergence threshold on every weight and rate change
    pub em_tolerance: f64,
    /// Weight floor applied after each E-step
    pub min_em_weight: f64,
    /// Tolerance of the per-category tree-scaling search in the M-step
    pub em_scaling_tolerance: f64,
}

impl Default for FreeRateConfig {
    fn default() -> Self {
        Self {
            schedule: FreeRateSchedule::default(),
            sorted: true,
            em_max_iterations: 100,
            em_tolerance: 1e-4,
            min_em_weight: 1e-4,
            em_scaling_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for pattern loops; 0 lets rayon decide
    pub n_threads: usize,
    pub memory_mode: MemoryMode,
    pub scaling: Scaling,
    /// Smallest number of patterns handed to one worker
    pub min_parallel_patterns: usize,
    pub branch: BranchOptConfig,
    pub free_rate: FreeRateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_threads: 0,
            memory_mode: MemoryMode::default(),
            scaling: Scaling::default(),
            min_parallel_patterns: 64,
            branch: BranchOptConfig::default(),
            free_rate: FreeRateConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.branch;
        if !(b.min_length > 0.0 && b.min_length < b.max_length) {
            return Err(PhyloError::invalid(
                "branch.min_length",
                format!("need 0 < min_length < max_length, got [{}, {}]", b.min_length, b.max_length),
            ));
        }
        if b.tolerance <= 0.0 || b.max_newton_steps == 0 {
            return Err(PhyloError::invalid(
                "branch.tolerance",
                "tolerance and max_newton_steps must be positive",
            ));
        }
        if !(b.sweep_tolerance > 0.0) || b.max_sweeps == 0 {
            return Err(PhyloError::invalid(
                "branch.sweep_tolerance",
                "sweep_tolerance and max_sweeps must be positive",
            ));
        }
        let f = &self.free_rate;
        if !(f.min_em_weight > 0.0 && f.min_em_weight < 1.0) {
            return Err(PhyloError::invalid(
                "free_rate.min_em_weight",
                format!("must lie in (0, 1), got {}", f.min_em_weight),
            ));
        }
        if f.em_tolerance <= 0.0 || f.em_scaling_tolerance <= 0.0 {
            return Err(PhyloError::invalid(
                "free_rate.em_tolerance",
                "EM tolerances must be positive",
            ));
        }
        if self.min_parallel_patterns == 0 {
            return Err(PhyloError::invalid("min_parallel_patterns", "must be at least 1"));
        }
        Ok(())
    }
}
