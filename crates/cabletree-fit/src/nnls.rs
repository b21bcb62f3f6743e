// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Non-negative least squares (Lawson–Hanson active set).
//!
//! Solves `min ‖A x - b‖₂` subject to `x ≥ 0`. The compartment fits are
//! small and dense, so the inner unconstrained solves go through an SVD.

use nalgebra::{DMatrix, DVector};

use crate::error::{FitError, Result};

/// Least-squares solve restricted to the columns in the passive set.
fn solve_subproblem(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    active: &[bool],
) -> Result<DVector<f64>> {
    let cols: Vec<usize> = (0..a.ncols()).filter(|&j| active[j]).collect();
    let mut sub = DMatrix::<f64>::zeros(a.nrows(), cols.len());
    for (k, &j) in cols.iter().enumerate() {
        sub.set_column(k, &a.column(j));
    }
    let solution = sub
        .svd(true, true)
        .solve(b, 1e-14)
        .map_err(|e| FitError::InvalidLocations(format!("inner least squares failed: {e}")))?;
    let mut full = DVector::<f64>::zeros(a.ncols());
    for (k, &j) in cols.iter().enumerate() {
        full[j] = solution[k];
    }
    Ok(full)
}

/// Solve `min ‖A x - b‖` with `x ≥ 0`.
///
/// `max_iterations` bounds the outer active-set loop; `tolerance` is the
/// dual-feasibility threshold on the gradient.
pub fn nnls(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<DVector<f64>> {
    let n = a.ncols();
    if a.nrows() != b.len() {
        return Err(FitError::InvalidLocations(format!(
            "NNLS dimension mismatch: {} rows vs {} targets",
            a.nrows(),
            b.len()
        )));
    }
    let mut x = DVector::<f64>::zeros(n);
    let mut active = vec![false; n];
    let mut iterations = 0;

    loop {
        let gradient = a.transpose() * (b - a * &x);
        let candidate = (0..n)
            .filter(|&j| !active[j])
            .max_by(|&i, &j| {
                gradient[i]
                    .partial_cmp(&gradient[j])
                    .expect("finite gradient")
            });
        match candidate {
            Some(j) if gradient[j] > tolerance => active[j] = true,
            _ => return Ok(x),
        }

        loop {
            iterations += 1;
            if iterations > max_iterations {
                let residual = (b - a * &x).norm();
                return Err(FitError::FitFailure {
                    residual,
                    tolerance,
                    iterations: max_iterations,
                    remedy: "ill-conditioned non-negative fit; rescale the problem".into(),
                });
            }
            let z = solve_subproblem(a, b, &active)?;
            let blocking: Vec<usize> = (0..n)
                .filter(|&j| active[j] && z[j] <= 0.0)
                .collect();
            if blocking.is_empty() {
                x = z;
                break;
            }
            // Step to the boundary of the feasible region.
            let mut alpha = f64::INFINITY;
            for &j in &blocking {
                let denom = x[j] - z[j];
                if denom > 0.0 {
                    alpha = alpha.min(x[j] / denom);
                }
            }
            if !alpha.is_finite() {
                alpha = 0.0;
            }
            for j in 0..n {
                if active[j] {
                    x[j] += alpha * (z[j] - x[j]);
                    if x[j] <= 1e-14 {
                        x[j] = 0.0;
                        active[j] = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_unconstrained_optimum_is_returned_when_feasible() {
        let a = dmatrix![1.0, 0.0; 0.0, 1.0; 1.0, 1.0];
        let b = dvector![1.0, 2.0, 3.0];
        let x = nnls(&a, &b, 100, 1e-12).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_optimum_is_clamped() {
        // Unconstrained solution would need x[1] < 0.
        let a = dmatrix![1.0, 1.0; 0.0, 1.0];
        let b = dvector![2.0, -1.0];
        let x = nnls(&a, &b, 100, 1e-12).unwrap();
        assert!(x[1] >= 0.0);
        assert!(x[0] >= 0.0);
        // Best non-negative fit puts everything on the first column.
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert!(x[1].abs() < 1e-12);
    }

    #[test]
    fn test_recovers_exact_nonnegative_solution() {
        let a = dmatrix![
            2.0, 1.0, 0.0;
            1.0, 3.0, 1.0;
            0.0, 1.0, 4.0;
            1.0, 0.0, 2.0;
        ];
        let truth = dvector![0.5, 1.5, 0.25];
        let b = &a * &truth;
        let x = nnls(&a, &b, 200, 1e-12).unwrap();
        for i in 0..3 {
            assert!((x[i] - truth[i]).abs() < 1e-8, "x[{i}] = {}", x[i]);
        }
    }

    #[test]
    fn test_iteration_budget() {
        let a = dmatrix![1.0, 1.0 + 1e-12; 1.0, 1.0];
        let b = dvector![1.0, 2.0];
        let result = nnls(&a, &b, 1, 1e-12);
        // Either converges immediately or reports the exhausted budget with
        // the residual; it must not loop forever.
        if let Err(FitError::FitFailure { iterations, .. }) = result {
            assert_eq!(iterations, 1);
        }
    }
}
