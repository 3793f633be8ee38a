/// phylolik: maximum-likelihood phylogenetics engine
///
/// Log-likelihood of an unrooted tree under a reversible substitution model
/// with discrete rate heterogeneity, computed by Felsenstein pruning in the
/// eigenbasis of the rate matrix, plus branch-length and rate-parameter
/// optimizers built on top of it.
///
/// Pattern loops run on a rayon pool owned by each engine; the Python
/// bindings are behind the `python` feature.

pub mod alignment;
pub mod arena;
pub mod branch;
pub mod checkpoint;
pub mod codon;
pub mod config;
pub mod error;
pub mod freerate;
pub mod kernel;
pub mod likelihood;
pub mod matrix;
pub mod model;
pub mod optimize;
pub mod qmatrix;
pub mod rates;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use alignment::PatternSet;
pub use branch::BranchEvaluation;
pub use checkpoint::Checkpoint;
pub use config::{BranchOptConfig, EngineConfig, FreeRateConfig, FreeRateSchedule, MemoryMode, Scaling};
pub use error::{PhyloError, Result};
pub use freerate::{EmReport, FreeRate, ParameterMode};
pub use likelihood::{EngineStats, LikelihoodEngine};
pub use model::{ReversibleModel, SubstitutionModel};
pub use rates::{DiscreteGamma, RateHeterogeneity, SiteRates, UniformRate};
pub use tree::{BranchId, EdgeId, NodeId, Tree};
