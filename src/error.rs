/// Error taxonomy for the likelihood engine
///
/// Recoverable numerical problems (underflow, out-of-bound parameters) are
/// handled where they occur and only logged; everything here is fatal for
/// the computation that raised it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhyloError {
    /// Input rejected before any computation (tree shape, alignment, parameters)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// A precondition the engine relies on was violated; results would be wrong
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Eigendecomposition failed: {0}")]
    EigenDecomposition(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhyloError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::InternalConsistency(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PhyloError>;
