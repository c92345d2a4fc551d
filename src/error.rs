//! Error taxonomy for the leverage-score computation.
//!
//! Parameter problems are reported before any partition is touched, numerical
//! problems are reported instead of returning zeros or NaNs, and coordinator
//! memory pressure has its own variant so callers can react to it separately.

/// Errors raised while building a matrix or computing leverage scores.
#[derive(Debug, thiserror::Error)]
pub enum LeverageError {
    /// A caller-supplied parameter (`k`, `axis`, `q`, projection width, operand shape) is invalid.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Name of the offending parameter.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The sparse input violates a structural invariant.
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    /// Zero matrix, rank-deficient projection, non-finite iterate or SVD failure.
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// The dense post-processing step would not fit on the coordinator.
    #[error(
        "coordinator needs {required} bytes for dense post-processing, limit is {limit} bytes"
    )]
    ResourceExhaustion {
        /// Estimated footprint; `usize::MAX` when the estimate itself overflowed.
        required: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The cancellation flag was raised; observed at an iteration boundary.
    #[error("computation cancelled at iteration {iteration}")]
    Cancelled { iteration: usize },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl LeverageError {
    pub(crate) fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        LeverageError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LeverageError>;
