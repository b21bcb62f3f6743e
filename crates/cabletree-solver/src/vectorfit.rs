// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Rational approximation of sampled frequency responses by vector fitting.
//!
//! Iterative pole relocation: at each step a linear least-squares problem in
//! the current pole basis yields the scaling function's residues, whose
//! zeros — eigenvalues of the relocation matrix — become the next pole set.
//! Poles drifting into the right half-plane are flipped back, so the final
//! approximation is stable by construction; the fit fails when the residual
//! stays above tolerance after a bounded number of order increases.
//!
//! Real data is fitted with real poles or complex-conjugate pairs; the
//! least-squares systems are assembled in real arithmetic by stacking real
//! and imaginary sample parts.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::config::VectorFitConfig;
use crate::error::{Result, SolverError};
use crate::kernel::{C64, ExpKernel};

/// Internal pole bookkeeping: a real pole or a conjugate pair (the member
/// with positive imaginary part is stored).
#[derive(Debug, Clone, Copy)]
enum Pole {
    Real(f64),
    Pair(C64),
}

impl Pole {
    /// Number of real basis functions the pole contributes.
    fn width(&self) -> usize {
        match self {
            Pole::Real(_) => 1,
            Pole::Pair(_) => 2,
        }
    }
}

/// A stable rational approximation `F(s) ≈ Σ_m r_m / (s - p_m)`.
#[derive(Debug, Clone)]
pub struct RationalFit {
    /// Poles (conjugate pairs expanded), all in the left half-plane (rad/s).
    pub poles: Vec<C64>,
    /// Residues matching `poles` element-wise.
    pub residues: Vec<C64>,
    /// Relative RMS error of the fit over the samples.
    pub rms_error: f64,
}

impl RationalFit {
    /// Evaluate the rational approximation at a complex frequency.
    pub fn eval(&self, s: C64) -> C64 {
        self.poles
            .iter()
            .zip(&self.residues)
            .map(|(&p, &r)| r / (s - p))
            .sum()
    }

    /// Convert the pole/residue form to a sum-of-exponentials kernel
    /// (analytic inverse Laplace transform; rates in 1/ms).
    pub fn to_kernel(&self) -> Result<ExpKernel> {
        ExpKernel::new(
            self.poles.iter().map(|&p| -p * 1e-3).collect(),
            self.residues.iter().map(|&r| r * 1e-3).collect(),
        )
    }
}

/// Basis-function values of the pole set at one frequency.
fn basis_row(poles: &[Pole], s: C64) -> Vec<C64> {
    let mut row = Vec::new();
    for pole in poles {
        match *pole {
            Pole::Real(p) => row.push(C64::new(1.0, 0.0) / (s - C64::new(p, 0.0))),
            Pole::Pair(p) => {
                let d1 = C64::new(1.0, 0.0) / (s - p);
                let d2 = C64::new(1.0, 0.0) / (s - p.conj());
                row.push(d1 + d2);
                row.push(C64::new(0.0, 1.0) * (d1 - d2));
            }
        }
    }
    row
}

fn n_basis(poles: &[Pole]) -> usize {
    poles.iter().map(Pole::width).sum()
}

/// Residue-only linear least squares for a fixed pole set. Returns the real
/// coefficient vector and the relative RMS error.
fn solve_residues(
    poles: &[Pole],
    freqs: &[C64],
    values: &[C64],
) -> Result<(DVector<f64>, f64)> {
    let m = n_basis(poles);
    let k = freqs.len();
    let mut design = DMatrix::<f64>::zeros(2 * k, m);
    let mut rhs = DVector::<f64>::zeros(2 * k);
    for (i, (&s, &f)) in freqs.iter().zip(values).enumerate() {
        let row = basis_row(poles, s);
        for (j, phi) in row.iter().enumerate() {
            design[(i, j)] = phi.re;
            design[(k + i, j)] = phi.im;
        }
        rhs[i] = f.re;
        rhs[k + i] = f.im;
    }
    let coeffs = design
        .clone()
        .svd(true, true)
        .solve(&rhs, 1e-14)
        .map_err(|e| SolverError::InvalidInput(format!("residue solve failed: {e}")))?;
    let fit = &design * &coeffs;
    let mut err = 0.0;
    let mut norm = 0.0;
    for i in 0..2 * k {
        err += (fit[i] - rhs[i]).powi(2);
        norm += rhs[i].powi(2);
    }
    let rms = if norm > 0.0 { (err / norm).sqrt() } else { 0.0 };
    Ok((coeffs, rms))
}

/// One pole-relocation step of the fitting iteration.
fn relocate_poles(poles: &[Pole], freqs: &[C64], values: &[C64]) -> Result<Vec<Pole>> {
    let m = n_basis(poles);
    let k = freqs.len();
    // Unknowns: kernel residues (m) followed by scaling residues (m).
    let mut design = DMatrix::<f64>::zeros(2 * k, 2 * m);
    let mut rhs = DVector::<f64>::zeros(2 * k);
    for (i, (&s, &f)) in freqs.iter().zip(values).enumerate() {
        let row = basis_row(poles, s);
        for (j, phi) in row.iter().enumerate() {
            design[(i, j)] = phi.re;
            design[(k + i, j)] = phi.im;
            let scaled = -f * phi;
            design[(i, m + j)] = scaled.re;
            design[(k + i, m + j)] = scaled.im;
        }
        rhs[i] = f.re;
        rhs[k + i] = f.im;
    }
    let solution = design
        .svd(true, true)
        .solve(&rhs, 1e-14)
        .map_err(|e| SolverError::InvalidInput(format!("relocation solve failed: {e}")))?;
    let sigma_residues = solution.rows(m, m).into_owned();

    // Zeros of the scaling function: eigenvalues of A - b·c̃ᵀ.
    let mut relocation = DMatrix::<f64>::zeros(m, m);
    let mut b = DVector::<f64>::zeros(m);
    let mut offset = 0;
    for pole in poles {
        match *pole {
            Pole::Real(p) => {
                relocation[(offset, offset)] = p;
                b[offset] = 1.0;
                offset += 1;
            }
            Pole::Pair(p) => {
                relocation[(offset, offset)] = p.re;
                relocation[(offset, offset + 1)] = p.im;
                relocation[(offset + 1, offset)] = -p.im;
                relocation[(offset + 1, offset + 1)] = p.re;
                b[offset] = 2.0;
                offset += 2;
            }
        }
    }
    for i in 0..m {
        for j in 0..m {
            relocation[(i, j)] -= b[i] * sigma_residues[j];
        }
    }
    let eigenvalues = relocation.complex_eigenvalues();

    // Regroup into stable real poles and conjugate pairs.
    let mut new_poles = Vec::new();
    let mut used = vec![false; eigenvalues.len()];
    for i in 0..eigenvalues.len() {
        if used[i] {
            continue;
        }
        let mut ev = eigenvalues[i];
        if ev.re > 0.0 {
            ev = C64::new(-ev.re, ev.im);
        }
        if ev.im.abs() > 1e-9 * ev.norm().max(1e-30) {
            // Mark the conjugate partner as consumed.
            for j in (i + 1)..eigenvalues.len() {
                if !used[j] && (eigenvalues[j].conj() - eigenvalues[i]).norm() < 1e-6 * ev.norm().max(1e-30)
                {
                    used[j] = true;
                    break;
                }
            }
            new_poles.push(Pole::Pair(C64::new(ev.re, ev.im.abs())));
        } else {
            new_poles.push(Pole::Real(ev.re.min(-1e-12)));
        }
        used[i] = true;
    }
    Ok(new_poles)
}

/// Expand the internal pole list and real coefficients to complex
/// pole/residue pairs.
fn expand(poles: &[Pole], coeffs: &DVector<f64>) -> (Vec<C64>, Vec<C64>) {
    let mut out_poles = Vec::new();
    let mut out_residues = Vec::new();
    let mut offset = 0;
    for pole in poles {
        match *pole {
            Pole::Real(p) => {
                out_poles.push(C64::new(p, 0.0));
                out_residues.push(C64::new(coeffs[offset], 0.0));
                offset += 1;
            }
            Pole::Pair(p) => {
                let r = C64::new(coeffs[offset], coeffs[offset + 1]);
                out_poles.push(p);
                out_residues.push(r);
                out_poles.push(p.conj());
                out_residues.push(r.conj());
                offset += 2;
            }
        }
    }
    (out_poles, out_residues)
}

fn initial_poles(freqs: &[C64], n: usize) -> Vec<Pole> {
    let mut w_max = 0.0f64;
    let mut w_min = f64::INFINITY;
    for &s in freqs {
        let w = s.im.abs();
        if w > 0.0 {
            w_max = w_max.max(w);
            w_min = w_min.min(w);
        }
    }
    if !w_max.is_finite() || w_max == 0.0 {
        w_max = 1.0e4;
    }
    let w_lo = w_min.max(w_max * 1e-4);
    (0..n)
        .map(|i| {
            let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.5 };
            Pole::Real(-w_lo * (w_max / w_lo).powf(t))
        })
        .collect()
}

/// Fit a stable rational approximation to sampled frequency-domain data.
pub fn vector_fit(freqs: &[C64], values: &[C64], config: &VectorFitConfig) -> Result<RationalFit> {
    if freqs.len() != values.len() {
        return Err(SolverError::InvalidInput(
            "frequency and value arrays must have equal length".into(),
        ));
    }
    let mut n_poles = config.n_poles.max(1);
    let mut best_rms = f64::INFINITY;
    let mut total_iterations = 0;
    for retry in 0..=config.max_order_retries {
        if freqs.len() < 2 * n_poles + 1 {
            return Err(SolverError::InvalidInput(format!(
                "vector fitting with {n_poles} poles needs at least {} samples, got {}",
                2 * n_poles + 1,
                freqs.len()
            )));
        }
        let mut poles = initial_poles(freqs, n_poles);
        for _ in 0..config.max_iterations {
            total_iterations += 1;
            poles = relocate_poles(&poles, freqs, values)?;
            let (_, rms) = solve_residues(&poles, freqs, values)?;
            best_rms = best_rms.min(rms);
            if rms <= config.tolerance {
                let (coeffs, rms) = solve_residues(&poles, freqs, values)?;
                let (out_poles, out_residues) = expand(&poles, &coeffs);
                debug!(retry, n_poles, rms, "vector fit converged");
                return Ok(RationalFit {
                    poles: out_poles,
                    residues: out_residues,
                    rms_error: rms,
                });
            }
        }
        debug!(
            retry,
            n_poles, best_rms, "vector fit retrying with increased order"
        );
        n_poles += config.order_step;
    }
    Err(SolverError::FitFailure {
        residual: best_rms,
        tolerance: config.tolerance,
        iterations: total_iterations,
        remedy: "increase the pole budget or widen the frequency range",
    })
}

/// Vector-fit sampled input-impedance data and normalize the resulting
/// time-domain kernel so its surface matches the quasi-static impedance
/// `z0` (MΩ).
pub fn fit_input_kernel(
    freqs: &[C64],
    values: &[C64],
    z0: f64,
    config: &VectorFitConfig,
) -> Result<ExpKernel> {
    let fit = vector_fit(freqs, values, config)?;
    let mut kernel = fit.to_kernel()?;
    kernel.normalize_k_bar(z0)?;
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn omega_grid(n: usize, w_min: f64, w_max: f64) -> Vec<C64> {
        (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                C64::new(0.0, w_min * (w_max / w_min).powf(t))
            })
            .collect()
    }

    #[test]
    fn test_recovers_single_pole() {
        // exp(-t/τ) with τ = 10 ms: F(s) = 1/(s + 100).
        let tau = 0.01;
        let freqs = omega_grid(60, 1.0, 1e5);
        let values: Vec<C64> = freqs
            .iter()
            .map(|&s| C64::new(1.0, 0.0) / (s + 1.0 / tau))
            .collect();
        let fit = vector_fit(&freqs, &values, &VectorFitConfig::default()).unwrap();
        assert!(fit.rms_error < 1e-6);
        // The dominant pole sits at -1/τ.
        let (dominant, residue) = fit
            .poles
            .iter()
            .zip(&fit.residues)
            .max_by(|a, b| a.1.norm().partial_cmp(&b.1.norm()).unwrap())
            .map(|(&p, &r)| (p, r))
            .unwrap();
        assert!(
            (dominant.re + 1.0 / tau).abs() < 1e-3 * (1.0 / tau),
            "pole {dominant}"
        );
        assert!((residue.re - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_all_poles_are_stable() {
        let freqs = omega_grid(80, 1.0, 1e5);
        let values: Vec<C64> = freqs
            .iter()
            .map(|&s| {
                C64::new(800.0, 0.0) / (s + 90.0) + C64::new(150.0, 0.0) / (s + 2.0e3)
                    + C64::new(40.0, 0.0) / (s + 3.0e4)
            })
            .collect();
        let fit = vector_fit(&freqs, &values, &VectorFitConfig::default()).unwrap();
        for pole in &fit.poles {
            assert!(pole.re < 0.0, "unstable pole {pole}");
        }
        assert!(fit.rms_error < 1e-5);
    }

    #[test]
    fn test_time_domain_kernel_is_causal_and_normalized() {
        let tau = 0.005;
        let freqs = omega_grid(60, 1.0, 1e5);
        let values: Vec<C64> = freqs
            .iter()
            .map(|&s| C64::new(2.0, 0.0) / (s + 1.0 / tau))
            .collect();
        let z0 = 2.0 * tau; // F(0)
        let kernel =
            fit_input_kernel(&freqs, &values, z0, &VectorFitConfig::default()).unwrap();
        for &t in &[-5.0, -1.0, -1e-6] {
            assert_eq!(kernel.eval(t), 0.0);
        }
        assert!((kernel.k_bar() - z0).abs() < 1e-9);
        // Reconstruction matches exp decay: k(t) = 2 e^{-t/τ} per second,
        // i.e. 2e-3·e^{-t/τ_ms} per ms.
        let expected = 2.0e-3 * (-1.0f64 / 5.0).exp();
        assert!((kernel.eval(1.0) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_insufficient_samples_is_rejected() {
        let freqs = omega_grid(5, 1.0, 1e3);
        let values = vec![C64::new(1.0, 0.0); 5];
        assert!(matches!(
            vector_fit(&freqs, &values, &VectorFitConfig::default()),
            Err(SolverError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_fit_failure_reports_residual() {
        // Noise-like data that a 1-pole budget with no retries cannot fit.
        let freqs = omega_grid(40, 1.0, 1e5);
        let values: Vec<C64> = freqs
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let wiggle = if i % 2 == 0 { 1.0 } else { -1.0 };
                C64::new(wiggle, 0.0) + C64::new(1.0, 0.0) / (s + 50.0)
            })
            .collect();
        let config = VectorFitConfig {
            n_poles: 1,
            max_order_retries: 0,
            max_iterations: 5,
            tolerance: 1e-9,
            ..Default::default()
        };
        let err = vector_fit(&freqs, &values, &config).unwrap_err();
        match err {
            SolverError::FitFailure { residual, tolerance, .. } => {
                assert!(residual > tolerance);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
