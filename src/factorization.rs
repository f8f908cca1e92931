// Alternating constrained least-squares factorization.
//
// Decomposes an observation matrix Y (features x samples) into a mixing
// matrix Omega (samples x K, simplex rows) and a signature matrix Mu
// (features x K, entries in [0, 1]) by alternating the two per-row
// constrained solves from `solvers`. Also hosts the multi-K driver and the
// SVD-based common initializer helper.

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis, Slice, Zip};
use ndarray_linalg::SVDInto;
use rayon::prelude::*;

use crate::error::CellMixError;
use crate::solvers::{sanitize_simplex_rows, solve_box_ls, solve_simplex_ls};

/// One fitted candidate model: the factor pair for a single component
/// count K.
#[derive(Clone, Debug)]
pub struct FactorModel {
    /// Number of latent components.
    pub k: usize,
    /// Mixing proportions, shape (samples, k). Every row is non-negative
    /// and sums to 1 within 1e-8.
    pub omega: Array2<f64>,
    /// Signatures, shape (features, k). Every entry lies in [0, 1] within
    /// 1e-8.
    pub mu: Array2<f64>,
}

impl FactorModel {
    /// The model's reconstruction of the observation matrix,
    /// `Mu * Omega^T`, shape (features, samples).
    pub fn reconstruction(&self) -> Array2<f64> {
        self.mu.dot(&self.omega.t())
    }
}

/// Which side of the factorization the caller's starting estimate supplies.
///
/// An explicit enum rather than shape sniffing: when the feature and sample
/// counts coincide, the orientation of a bare matrix would be ambiguous.
#[derive(Clone, Copy, Debug)]
pub enum InitialFactor<'a> {
    /// A (features x >= K) starting signature matrix; sliced to its first K
    /// columns and clamped into [0, 1].
    Signatures(ArrayView2<'a, f64>),
    /// A (samples x >= K) starting mixing matrix; sliced to its first K
    /// columns and row-renormalized onto the simplex. Converted to a
    /// signature estimate with one box half-step before alternation begins.
    Proportions(ArrayView2<'a, f64>),
}

fn check_positive(name: &'static str, value: usize) -> Result<(), CellMixError> {
    if value == 0 {
        return Err(CellMixError::param(name, value));
    }
    Ok(())
}

fn check_nonempty(y: ArrayView2<f64>) -> Result<(), CellMixError> {
    if y.nrows() == 0 || y.ncols() == 0 {
        return Err(CellMixError::shape(
            "observation matrix",
            "at least 1 feature and 1 sample".to_string(),
            format!("{} x {}", y.nrows(), y.ncols()),
        ));
    }
    Ok(())
}

/// Re-estimates the mixing matrix with the signatures held fixed.
///
/// Solves one simplex-constrained least-squares problem per sample column of
/// `y` against the fixed `mu`, in parallel; returns the (samples x K) mixing
/// matrix. With K = 1 the single component explains every sample and the
/// result collapses to a column of ones.
pub fn update_omega(y: ArrayView2<f64>, mu: ArrayView2<f64>) -> Array2<f64> {
    let n_samples = y.ncols();
    let k = mu.ncols();
    if k == 1 {
        return Array2::ones((n_samples, 1));
    }

    let gram = mu.t().dot(&mu);
    let cross = mu.t().dot(&y); // (k, samples)

    let mut omega = Array2::<f64>::zeros((n_samples, k));
    Zip::from(omega.rows_mut())
        .and(cross.columns())
        .par_for_each(|mut omega_row, cross_col| {
            omega_row.assign(&solve_simplex_ls(&gram, cross_col));
        });
    omega
}

/// Re-estimates the signature matrix with the mixing proportions held fixed.
///
/// Solves one box-constrained least-squares problem per feature row of `y`
/// against the fixed `omega`, in parallel; returns the (features x K)
/// signature matrix. An all-zero feature row yields an all-zero signature
/// row.
pub fn update_mu(y: ArrayView2<f64>, omega: ArrayView2<f64>) -> Array2<f64> {
    let n_features = y.nrows();
    let k = omega.ncols();

    let gram = omega.t().dot(&omega);
    let cross = y.dot(&omega); // (features, k)

    let mut mu = Array2::<f64>::zeros((n_features, k));
    Zip::from(mu.rows_mut())
        .and(cross.rows())
        .par_for_each(|mut mu_row, cross_row| {
            mu_row.assign(&solve_box_ls(&gram, cross_row));
        });
    mu
}

/// Fits the constrained factorization for a single component count K.
///
/// Runs exactly `max_iterations` rounds of alternating constrained least
/// squares: each round re-estimates Omega with Mu fixed (per-sample simplex
/// solves), then Mu with Omega fixed (per-feature box solves). There is no
/// convergence-based early exit, so the iteration budget is the one the
/// caller asked for.
///
/// * `y` - Observation matrix, shape (features, samples).
/// * `k` - Number of latent components, >= 1.
/// * `initial` - Starting estimate for one factor; matrices wider than K are
///   sliced to their first K columns.
/// * `max_iterations` - Number of alternation rounds, >= 1.
///
/// # Errors
/// `InvalidParameter` for a zero `k` or `max_iterations`; `ShapeMismatch`
/// when the initializer's row count does not match the supplied side of `y`
/// or it has fewer than `k` columns.
pub fn fit(
    y: ArrayView2<f64>,
    k: usize,
    initial: InitialFactor<'_>,
    max_iterations: usize,
) -> Result<FactorModel, CellMixError> {
    check_positive("k", k)?;
    check_positive("max_iterations", max_iterations)?;
    check_nonempty(y)?;

    let mut mu = initial_signatures(y, k, initial)?;

    debug!(
        "Fitting K={} on {} features x {} samples for {} iterations",
        k,
        y.nrows(),
        y.ncols(),
        max_iterations
    );

    let mut omega = update_omega(y, mu.view());
    mu = update_mu(y, omega.view());
    for _ in 1..max_iterations {
        omega = update_omega(y, mu.view());
        mu = update_mu(y, omega.view());
    }

    Ok(FactorModel { k, omega, mu })
}

/// Resolves the caller's starting estimate into a (features x k) signature
/// matrix.
fn initial_signatures(
    y: ArrayView2<f64>,
    k: usize,
    initial: InitialFactor<'_>,
) -> Result<Array2<f64>, CellMixError> {
    match initial {
        InitialFactor::Signatures(m) => {
            if m.nrows() != y.nrows() || m.ncols() < k {
                return Err(CellMixError::shape(
                    "initial signature factor",
                    format!("{} x >= {}", y.nrows(), k),
                    format!("{} x {}", m.nrows(), m.ncols()),
                ));
            }
            let mut mu = m.slice_axis(Axis(1), Slice::from(0..k)).to_owned();
            mu.mapv_inplace(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 });
            Ok(mu)
        }
        InitialFactor::Proportions(m) => {
            if m.nrows() != y.ncols() || m.ncols() < k {
                return Err(CellMixError::shape(
                    "initial mixing factor",
                    format!("{} x >= {}", y.ncols(), k),
                    format!("{} x {}", m.nrows(), m.ncols()),
                ));
            }
            let mut omega = m.slice_axis(Axis(1), Slice::from(0..k)).to_owned();
            sanitize_simplex_rows(&mut omega);
            Ok(update_mu(y, omega.view()))
        }
    }
}

/// Fits one candidate model per component count in `ks`.
///
/// Every K receives the same common initializer, sliced to its first K
/// columns; the per-K fits share no other state and run in parallel. The
/// result is keyed explicitly by K, so a non-contiguous or non-unit-based
/// `ks` needs no positional bookkeeping.
///
/// # Errors
/// `InvalidParameter` for an empty `ks` or a zero entry;  `ShapeMismatch`
/// when `initial_full` has fewer columns than the largest K.
pub fn fit_array(
    y: ArrayView2<f64>,
    ks: &[usize],
    initial_full: InitialFactor<'_>,
    max_iterations: usize,
) -> Result<BTreeMap<usize, FactorModel>, CellMixError> {
    if ks.is_empty() {
        return Err(CellMixError::param("ks", "empty candidate list"));
    }
    for &k in ks {
        check_positive("ks", k)?;
    }
    check_positive("max_iterations", max_iterations)?;
    check_nonempty(y)?;

    let max_k = ks.iter().copied().max().unwrap_or(1);
    let initial_cols = match initial_full {
        InitialFactor::Signatures(m) | InitialFactor::Proportions(m) => m.ncols(),
    };
    if initial_cols < max_k {
        return Err(CellMixError::shape(
            "common initial factor",
            format!(">= {} columns", max_k),
            format!("{} columns", initial_cols),
        ));
    }

    info!(
        "Fitting {} candidate models (K in {:?}) on {} features x {} samples",
        ks.len(),
        ks,
        y.nrows(),
        y.ncols()
    );

    let models: BTreeMap<usize, FactorModel> = ks
        .par_iter()
        .map(|&k| fit(y, k, initial_full, max_iterations).map(|model| (k, model)))
        .collect::<Result<_, _>>()?;
    Ok(models)
}

/// Builds a common (features x k_max) starting signature matrix from the
/// leading left singular vectors of `y`.
///
/// Each singular vector column is sign-flipped so its mean is non-negative,
/// then clamped into [0, 1]; the leading vector of a non-negative matrix is
/// near-uniformly positive, and later columns only need to be rough starting
/// directions. The result is meant to be passed to [`fit_array`] as
/// [`InitialFactor::Signatures`].
///
/// # Errors
/// `InvalidParameter` when `k_max` is zero or exceeds `min(features,
/// samples)`; `LinAlg` when the SVD itself fails.
pub fn svd_initial_factor(y: ArrayView2<f64>, k_max: usize) -> Result<Array2<f64>, CellMixError> {
    check_positive("k_max", k_max)?;
    check_nonempty(y)?;
    let rank_bound = y.nrows().min(y.ncols());
    if k_max > rank_bound {
        return Err(CellMixError::param(
            "k_max",
            format!("{} exceeds min(features, samples) = {}", k_max, rank_bound),
        ));
    }

    let (u, _singular_values, _) = y.to_owned().svd_into(true, false)?;
    let u = u.ok_or_else(|| {
        CellMixError::param("k_max", "SVD did not return left singular vectors")
    })?;

    let mut initial = u.slice_axis(Axis(1), Slice::from(0..k_max)).to_owned();
    for mut column in initial.columns_mut() {
        let mean = column.mean().unwrap_or(0.0);
        if mean < 0.0 {
            column.mapv_inplace(|v| -v);
        }
        column.mapv_inplace(|v| v.clamp(0.0, 1.0));
    }
    Ok(initial)
}
