// Signature projection against a fixed mixing matrix.

use log::info;
use ndarray::{Array2, ArrayView2};

use crate::error::CellMixError;
use crate::factorization::update_mu;

/// Re-estimates signatures for an arbitrary feature set given a previously
/// fitted mixing matrix.
///
/// Solves the per-feature box-constrained least-squares problem of the
/// signature half-step for every row of `y_full` against the fixed `omega`.
/// The feature set may differ from (and typically vastly exceeds) the one
/// `omega` was fitted on; the sample columns of `y_full` must match
/// `omega`'s rows in count and order. This is how a mixing matrix estimated
/// on a reduced, informative feature subset is reused to reconstruct
/// signatures over the complete feature set.
///
/// # Errors
/// `ShapeMismatch` when `y_full` has a different number of sample columns
/// than `omega` has rows; no silent truncation or padding. `InvalidParameter`
/// when `omega` has no components.
pub fn project(
    y_full: ArrayView2<f64>,
    omega: ArrayView2<f64>,
) -> Result<Array2<f64>, CellMixError> {
    if omega.ncols() == 0 {
        return Err(CellMixError::param("omega", "zero components"));
    }
    if y_full.ncols() != omega.nrows() {
        return Err(CellMixError::shape(
            "project sample columns",
            format!("{} (rows of omega)", omega.nrows()),
            format!("{}", y_full.ncols()),
        ));
    }

    info!(
        "Projecting {} features onto {} fixed components ({} samples)",
        y_full.nrows(),
        omega.ncols(),
        omega.nrows()
    );
    Ok(update_mu(y_full, omega))
}
