// Bootstrap deviance evaluation and component-count selection.
//
// Each candidate model's lack of fit is scored on with-replacement resamples
// of the sample columns: the signatures stay fixed at their original
// estimates and only the mixing proportions are refit per replicate. The
// component count K with the smallest trimmed mean deviance across
// replicates wins.

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::error::CellMixError;
use crate::factorization::{update_omega, FactorModel};

/// Clamp applied to observed and reconstructed values before the log terms
/// of the deviance, so exact 0/1 entries stay finite.
const DEVIANCE_EPSILON: f64 = 1e-9;

/// Deviance scores indexed by (bootstrap replicate, candidate K).
///
/// Row 0 holds the deviance of each original (non-resampled) fit and serves
/// as a reference only; rows 1..=R hold the bootstrap replicates and are the
/// rows the trimmed-mean aggregation in [`select_k`] consumes.
#[derive(Clone, Debug)]
pub struct DevianceTable {
    ks: Vec<usize>,
    values: Array2<f64>,
}

impl DevianceTable {
    /// Assembles a table from an externally computed (R + 1) x |Ks| score
    /// matrix whose row 0 is the reference (non-resampled) row.
    ///
    /// # Errors
    /// `ShapeMismatch` when the column count differs from `ks` or the table
    /// has no replicate rows; `InvalidParameter` when `ks` is empty or not
    /// strictly ascending.
    pub fn from_parts(ks: Vec<usize>, values: Array2<f64>) -> Result<Self, CellMixError> {
        if ks.is_empty() {
            return Err(CellMixError::param("ks", "empty candidate list"));
        }
        if values.ncols() != ks.len() || values.nrows() < 2 {
            return Err(CellMixError::shape(
                "deviance table",
                format!(">= 2 rows x {} columns", ks.len()),
                format!("{} x {}", values.nrows(), values.ncols()),
            ));
        }
        if ks.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(CellMixError::param(
                "ks",
                "candidate component counts must be strictly ascending",
            ));
        }
        Ok(DevianceTable { ks, values })
    }

    /// The candidate component counts, ascending, one per column.
    pub fn ks(&self) -> &[usize] {
        &self.ks
    }

    /// The full (R + 1) x |Ks| table, reference row included.
    pub fn values(&self) -> ArrayView2<f64> {
        self.values.view()
    }

    /// Number of bootstrap replicates R (excludes the reference row).
    pub fn num_replicates(&self) -> usize {
        self.values.nrows() - 1
    }
}

/// Binomial-type deviance between an observed matrix and a model
/// reconstruction of it.
///
/// `2 * sum[ y*ln(y/yhat) + (1-y)*ln((1-y)/(1-yhat)) ]` over all cells, with
/// both operands clamped into `[1e-9, 1 - 1e-9]` before the logs. The
/// clamping is silent and keeps the score finite and non-negative at exact
/// 0/1 methylation values.
///
/// # Errors
/// `ShapeMismatch` when the two matrices do not have the same dimensions.
pub fn binomial_deviance(
    observed: ArrayView2<f64>,
    reconstructed: ArrayView2<f64>,
) -> Result<f64, CellMixError> {
    if observed.dim() != reconstructed.dim() {
        return Err(CellMixError::shape(
            "binomial deviance operands",
            format!("{} x {}", observed.nrows(), observed.ncols()),
            format!("{} x {}", reconstructed.nrows(), reconstructed.ncols()),
        ));
    }
    Ok(deviance_unchecked(observed, reconstructed))
}

// Shapes already agree on every internal call site.
fn deviance_unchecked(observed: ArrayView2<f64>, reconstructed: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    for (&y, &fitted) in observed.iter().zip(reconstructed.iter()) {
        let y = y.clamp(DEVIANCE_EPSILON, 1.0 - DEVIANCE_EPSILON);
        let fitted = fitted.clamp(DEVIANCE_EPSILON, 1.0 - DEVIANCE_EPSILON);
        total += y * (y / fitted).ln() + (1.0 - y) * ((1.0 - y) / (1.0 - fitted)).ln();
    }
    2.0 * total
}

/// Scores every candidate model over R bootstrap resamples of the sample
/// columns.
///
/// Row 0 is the deviance of each model's original fit on the full sample
/// set. For each replicate, a multiset of sample indices is drawn uniformly
/// with replacement, the resampled matrix is assembled from those columns,
/// and each model's mixing matrix is refit against it with the signatures
/// held fixed (only the Omega half-step, run `refit_iterations` times; the
/// per-sample solves are exact given fixed signatures, so additional rounds
/// are idempotent). The deviance of the refit model on the resample fills
/// rows 1..=R.
///
/// All resampling indices are drawn up front from a single `ChaCha8Rng`, so
/// a given `seed` reproduces the table exactly while the per-replicate
/// refits run in parallel. `None` seeds from entropy.
///
/// # Errors
/// `InvalidParameter` for zero `r` or `refit_iterations`, or an empty model
/// set; `ShapeMismatch` when a model's factors do not match `y`.
pub fn bootstrap_deviance(
    models: &BTreeMap<usize, FactorModel>,
    y: ArrayView2<f64>,
    r: usize,
    refit_iterations: usize,
    seed: Option<u64>,
) -> Result<DevianceTable, CellMixError> {
    if models.is_empty() {
        return Err(CellMixError::param("models", "empty candidate model set"));
    }
    if r == 0 {
        return Err(CellMixError::param("r", r));
    }
    if refit_iterations == 0 {
        return Err(CellMixError::param("refit_iterations", refit_iterations));
    }
    let n_features = y.nrows();
    let n_samples = y.ncols();
    for model in models.values() {
        if model.mu.nrows() != n_features || model.omega.nrows() != n_samples {
            return Err(CellMixError::shape(
                "candidate model factors",
                format!("Mu {} x K, Omega {} x K", n_features, n_samples),
                format!(
                    "Mu {} x {}, Omega {} x {}",
                    model.mu.nrows(),
                    model.mu.ncols(),
                    model.omega.nrows(),
                    model.omega.ncols()
                ),
            ));
        }
    }

    let ks: Vec<usize> = models.keys().copied().collect();
    info!(
        "Bootstrapping deviance: {} replicates over K in {:?} ({} samples)",
        r, ks, n_samples
    );

    let mut values = Array2::<f64>::zeros((r + 1, ks.len()));
    for (col, k) in ks.iter().enumerate() {
        let model = &models[k];
        values[[0, col]] = deviance_unchecked(y, model.reconstruction().view());
    }

    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };
    let resample_indices: Vec<Vec<usize>> = (0..r)
        .map(|_| (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect())
        .collect();

    let replicate_rows: Vec<Vec<f64>> = resample_indices
        .par_iter()
        .enumerate()
        .map(|(replicate, indices)| {
            let resampled = y.select(Axis(1), indices);
            let row: Vec<f64> = ks
                .iter()
                .map(|k| {
                    let model = &models[k];
                    let mut omega = update_omega(resampled.view(), model.mu.view());
                    for _ in 1..refit_iterations {
                        omega = update_omega(resampled.view(), model.mu.view());
                    }
                    deviance_unchecked(
                        resampled.view(),
                        model.mu.dot(&omega.t()).view(),
                    )
                })
                .collect();
            debug!("Replicate {} deviances: {:?}", replicate + 1, row);
            row
        })
        .collect();

    for (replicate, row) in replicate_rows.into_iter().enumerate() {
        for (col, deviance) in row.into_iter().enumerate() {
            values[[replicate + 1, col]] = deviance;
        }
    }

    Ok(DevianceTable { ks, values })
}

/// Picks the component count with the smallest trimmed mean bootstrap
/// deviance.
///
/// The reference row (row 0) is excluded; each column's replicate deviances
/// are sorted and `trim_fraction` of them discarded from each tail before
/// averaging, downweighting outlier resamples. Ties break toward the
/// smallest K.
///
/// # Errors
/// `InvalidParameter` when `trim_fraction` is outside `[0, 0.5)` or not
/// finite.
pub fn select_k(table: &DevianceTable, trim_fraction: f64) -> Result<usize, CellMixError> {
    if !trim_fraction.is_finite() || !(0.0..0.5).contains(&trim_fraction) {
        return Err(CellMixError::param("trim_fraction", trim_fraction));
    }

    let replicates = table.num_replicates();
    let mut best: Option<(usize, f64)> = None;
    for (col, &k) in table.ks.iter().enumerate() {
        let mut column: Vec<f64> = (1..=replicates)
            .map(|row| table.values[[row, col]])
            .collect();
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        // Keep at least one central value even under aggressive trimming.
        let cut = ((replicates as f64) * trim_fraction).floor() as usize;
        let cut = cut.min((replicates - 1) / 2);
        let kept = &column[cut..replicates - cut];
        let trimmed_mean = kept.iter().sum::<f64>() / kept.len() as f64;

        debug!("K={}: trimmed mean deviance {:.6}", k, trimmed_mean);
        if best.map_or(true, |(_, current)| trimmed_mean < current) {
            best = Some((k, trimmed_mean));
        }
    }

    let (k, deviance) = best.ok_or_else(|| CellMixError::param("table", "no candidate columns"))?;
    info!("Selected K={} (trimmed mean deviance {:.6})", k, deviance);
    Ok(k)
}
