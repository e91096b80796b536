use thiserror::Error;

use crate::settings::Algorithm;

/// Failures surfaced by the splitting core.
///
/// Configuration problems are reported as soon as they are detected instead of
/// aborting the process; a pass either completes or returns one of these.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SplitError {
    #[error("dimension mismatch in {what}: expected {expected}, got {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{0} must be bound before use")]
    UnboundDependency(&'static str),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("patch was split with {found:?} but the criterion expects {expected:?}")]
    AlgorithmMismatch { expected: Algorithm, found: Algorithm },

    #[error("split pass cancelled with {pending} patches still pending")]
    Cancelled { pending: usize },

    #[error("manifold holds no patches")]
    EmptyManifold,

    #[error("no patch covers point {0:?}")]
    PointNotCovered(Vec<f64>),
}

pub type Result<T> = std::result::Result<T, SplitError>;

impl SplitError {
    pub(crate) fn mismatch(what: &'static str, expected: usize, found: usize) -> Self {
        SplitError::DimensionMismatch {
            what,
            expected,
            found,
        }
    }
}
