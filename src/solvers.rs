// Per-row constrained least-squares solvers.
//
// Both factorization half-steps reduce to many small independent quadratic
// programs over the shared Gram matrix of the fixed factor:
//
//   minimize  (1/2) x' G x - c' x
//
// subject to either the probability simplex (x >= 0, sum(x) = 1, one problem
// per sample column) or the unit box (0 <= x <= 1, one problem per feature
// row). Component counts are small (typically K <= 12), so an active-set
// method with dense LU solves of the free subsystem is both simple and fast.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;

/// Projects every row of a matrix onto the probability simplex in place:
/// non-finite and negative entries become zero, then each row is
/// renormalized to sum to 1. A row with no remaining mass becomes uniform.
pub fn sanitize_simplex_rows(matrix: &mut Array2<f64>) {
    let k = matrix.ncols();
    for mut row in matrix.rows_mut() {
        row.mapv_inplace(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
        let total: f64 = row.sum();
        if total <= f64::EPSILON {
            row.fill(1.0 / k as f64);
        } else {
            row.mapv_inplace(|v| v / total);
        }
    }
}

/// Tolerance below which an active-set coordinate or multiplier is treated
/// as satisfying its constraint.
const ACTIVE_SET_TOLERANCE: f64 = 1e-10;

/// The uniform point on the K-dimensional probability simplex.
pub fn uniform_simplex(k: usize) -> Array1<f64> {
    Array1::from_elem(k, 1.0 / k as f64)
}

/// Solves the equality-constrained subproblem on the free coordinate set:
/// the KKT system of `min (1/2) x'Gx - c'x  s.t.  sum(x) = 1` restricted to
/// `free`, returning `(x_free..., lambda)`. `None` signals a singular or
/// non-finite system.
fn solve_simplex_kkt(
    gram: &Array2<f64>,
    rhs: ArrayView1<f64>,
    free: &[usize],
) -> Option<Array1<f64>> {
    let m = free.len();
    let mut kkt = Array2::<f64>::zeros((m + 1, m + 1));
    let mut b = Array1::<f64>::zeros(m + 1);
    for (row, &i) in free.iter().enumerate() {
        for (col, &j) in free.iter().enumerate() {
            kkt[[row, col]] = gram[[i, j]];
        }
        kkt[[row, m]] = 1.0;
        kkt[[m, row]] = 1.0;
        b[row] = rhs[i];
    }
    b[m] = 1.0;
    match kkt.solve(&b) {
        Ok(solution) if solution.iter().all(|v| v.is_finite()) => Some(solution),
        _ => None,
    }
}

/// Clamps negatives to zero and renormalizes onto the simplex. A vector with
/// no remaining mass becomes the uniform point.
fn sanitize_simplex(mut x: Array1<f64>) -> Array1<f64> {
    x.mapv_inplace(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let total: f64 = x.sum();
    if total <= f64::EPSILON {
        return uniform_simplex(x.len());
    }
    x.mapv_inplace(|v| v / total);
    x
}

/// Simplex-constrained least squares for one sample.
///
/// Minimizes `(1/2) w'Gw - c'w` subject to `w >= 0` and `sum(w) = 1`, where
/// `G` is the Gram matrix of the fixed signature factor and `c` its
/// cross-product with the observed sample column. Active-set iteration:
/// solve the KKT system on the free set, pin the most negative coordinate at
/// zero, and release pinned coordinates whose Lagrange multiplier turns
/// negative. Degenerate systems fall back to the uniform simplex point.
pub fn solve_simplex_ls(gram: &Array2<f64>, rhs: ArrayView1<f64>) -> Array1<f64> {
    let k = gram.nrows();
    debug_assert_eq!(gram.ncols(), k);
    debug_assert_eq!(rhs.len(), k);

    // A single component explains the whole column.
    if k == 1 {
        return Array1::ones(1);
    }

    let mut free: Vec<usize> = (0..k).collect();
    let mut w = Array1::<f64>::zeros(k);

    // Each pass either pins or releases one coordinate, so 2K passes cover
    // every reachable active set; the few extra guard against cycling.
    for _ in 0..(2 * k + 8) {
        if free.is_empty() {
            return uniform_simplex(k);
        }
        let solution = match solve_simplex_kkt(gram, rhs, &free) {
            Some(s) => s,
            None => return uniform_simplex(k),
        };
        let lambda = solution[free.len()];

        // Pin the most negative free coordinate, if any.
        let mut pin: Option<(usize, f64)> = None;
        for (pos, _) in free.iter().enumerate() {
            let value = solution[pos];
            if value < -ACTIVE_SET_TOLERANCE && pin.map_or(true, |(_, worst)| value < worst) {
                pin = Some((pos, value));
            }
        }
        if let Some((pos, _)) = pin {
            free.remove(pos);
            continue;
        }

        w.fill(0.0);
        for (pos, &i) in free.iter().enumerate() {
            w[i] = solution[pos].max(0.0);
        }

        // Multiplier check on pinned coordinates: stationarity gives
        // nu_i = (Gw - c)_i + lambda, which must be non-negative at the
        // optimum. Release the worst violator.
        let gradient = gram.dot(&w);
        let mut release: Option<(usize, f64)> = None;
        for i in 0..k {
            if free.contains(&i) {
                continue;
            }
            let nu = gradient[i] - rhs[i] + lambda;
            if nu < -ACTIVE_SET_TOLERANCE && release.map_or(true, |(_, worst)| nu < worst) {
                release = Some((i, nu));
            }
        }
        match release {
            Some((i, _)) => {
                free.push(i);
                free.sort_unstable();
            }
            None => return sanitize_simplex(w),
        }
    }

    // Iteration cap reached (cycling on a near-degenerate system): the last
    // iterate is feasible after sanitizing.
    sanitize_simplex(w)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BoxBound {
    Free,
    Lower,
    Upper,
}

/// Box-constrained least squares for one feature.
///
/// Minimizes `(1/2) m'Gm - c'm` subject to `0 <= m <= 1`, where `G` is the
/// Gram matrix of the fixed mixing factor. Same active-set scheme as the
/// simplex solver, with coordinates pinned at either bound. Degenerate
/// systems fall back to the zero vector.
pub fn solve_box_ls(gram: &Array2<f64>, rhs: ArrayView1<f64>) -> Array1<f64> {
    let k = gram.nrows();
    debug_assert_eq!(gram.ncols(), k);
    debug_assert_eq!(rhs.len(), k);

    // An all-zero cross-product (e.g. an all-zero feature row) has the zero
    // vector as its exact constrained optimum.
    if rhs.iter().all(|v| *v == 0.0) {
        return Array1::zeros(k);
    }

    let mut state = vec![BoxBound::Free; k];
    let mut m = Array1::<f64>::zeros(k);

    for _ in 0..(3 * k + 8) {
        let free: Vec<usize> = (0..k).filter(|&i| state[i] == BoxBound::Free).collect();

        if !free.is_empty() {
            // Right-hand side absorbs the columns pinned at the upper bound.
            let mut sub = Array2::<f64>::zeros((free.len(), free.len()));
            let mut b = Array1::<f64>::zeros(free.len());
            for (row, &i) in free.iter().enumerate() {
                for (col, &j) in free.iter().enumerate() {
                    sub[[row, col]] = gram[[i, j]];
                }
                let mut adjusted = rhs[i];
                for j in 0..k {
                    if state[j] == BoxBound::Upper {
                        adjusted -= gram[[i, j]];
                    }
                }
                b[row] = adjusted;
            }
            let solution = match sub.solve(&b) {
                Ok(s) if s.iter().all(|v| v.is_finite()) => s,
                _ => return Array1::zeros(k),
            };

            // Pin the worst bound violator among the free coordinates.
            let mut pin: Option<(usize, BoxBound, f64)> = None;
            for (pos, &i) in free.iter().enumerate() {
                let value = solution[pos];
                let (bound, excess) = if value < -ACTIVE_SET_TOLERANCE {
                    (BoxBound::Lower, -value)
                } else if value > 1.0 + ACTIVE_SET_TOLERANCE {
                    (BoxBound::Upper, value - 1.0)
                } else {
                    continue;
                };
                if pin.map_or(true, |(_, _, worst)| excess > worst) {
                    pin = Some((i, bound, excess));
                }
            }
            if let Some((i, bound, _)) = pin {
                state[i] = bound;
                continue;
            }
            for (pos, &i) in free.iter().enumerate() {
                m[i] = solution[pos].clamp(0.0, 1.0);
            }
        }
        for i in 0..k {
            match state[i] {
                BoxBound::Lower => m[i] = 0.0,
                BoxBound::Upper => m[i] = 1.0,
                BoxBound::Free => {}
            }
        }

        // Multiplier check: g = Gm - c must be >= 0 at the lower bound and
        // <= 0 at the upper bound. Release the worst violator.
        let gradient = gram.dot(&m);
        let mut release: Option<(usize, f64)> = None;
        for i in 0..k {
            let g = gradient[i] - rhs[i];
            let violation = match state[i] {
                BoxBound::Lower => -g,
                BoxBound::Upper => g,
                BoxBound::Free => continue,
            };
            if violation > ACTIVE_SET_TOLERANCE
                && release.map_or(true, |(_, worst)| violation > worst)
            {
                release = Some((i, violation));
            }
        }
        match release {
            Some((i, _)) => state[i] = BoxBound::Free,
            None => return m,
        }
    }

    m.mapv_inplace(|v| v.clamp(0.0, 1.0));
    m
}
