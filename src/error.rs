// Error types for the deconvolution core.

use thiserror::Error;

/// Errors surfaced by the public factorization, bootstrap, and projection
/// operations.
///
/// Per-row constrained solves never surface errors: a singular or otherwise
/// degenerate per-sample/per-feature subproblem resolves to its documented
/// fallback (the uniform simplex point for mixing rows, the zero vector for
/// signature rows) instead of failing the whole decomposition.
#[derive(Debug, Error)]
pub enum CellMixError {
    /// Input matrix dimensions are inconsistent with the declared contract.
    /// Never retried; the caller supplied incompatible matrices.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// A scalar parameter (component count, replicate count, iteration
    /// budget, trim fraction) is outside its valid range.
    #[error("invalid parameter `{name}`: {value}")]
    InvalidParameter { name: &'static str, value: String },

    /// A dense linear-algebra routine failed outside the per-row solvers
    /// (currently only the SVD used by the initializer helper).
    #[error("linear algebra failure: {0}")]
    LinAlg(#[from] ndarray_linalg::error::LinalgError),
}

impl CellMixError {
    pub(crate) fn shape(context: &'static str, expected: String, actual: String) -> Self {
        CellMixError::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }

    pub(crate) fn param<V: std::fmt::Display>(name: &'static str, value: V) -> Self {
        CellMixError::InvalidParameter {
            name,
            value: value.to_string(),
        }
    }
}
