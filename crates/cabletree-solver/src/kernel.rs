// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Sum-of-exponentials kernels.
//!
//! A kernel `k(t) = Σ_n c_n e^{-a_n t}` with rates `a` in 1/ms and
//! prefactors `c` in MΩ/ms. Rates and prefactors may be complex (conjugate
//! pairs from rational fits); time-domain evaluation takes the real part.
//! Kernels are causal: they evaluate to zero for `t < 0`.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};

/// Complex double used throughout the solvers.
pub type C64 = Complex<f64>;

/// Tolerance used when deciding whether two rate vectors coincide.
const RATE_MERGE_TOL: f64 = 1e-12;

/// A causal kernel represented as a superposition of exponentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpKernel {
    /// Decay rates (1/ms).
    pub a: Vec<C64>,
    /// Prefactors (MΩ/ms).
    pub c: Vec<C64>,
}

impl ExpKernel {
    /// Build a kernel from rates and prefactors of equal length.
    pub fn new(a: Vec<C64>, c: Vec<C64>) -> Result<Self> {
        if a.len() != c.len() {
            return Err(SolverError::InvalidInput(format!(
                "kernel rate/prefactor length mismatch: {} vs {}",
                a.len(),
                c.len()
            )));
        }
        if a.is_empty() {
            return Err(SolverError::InvalidInput("empty kernel".into()));
        }
        Ok(ExpKernel { a, c })
    }

    /// Build a real-rate kernel.
    pub fn from_real(a: &[f64], c: &[f64]) -> Result<Self> {
        Self::new(
            a.iter().map(|&x| C64::new(x, 0.0)).collect(),
            c.iter().map(|&x| C64::new(x, 0.0)).collect(),
        )
    }

    /// Single-exponential kernel with prefactor `c` and a rate of 1 kHz.
    pub fn from_prefactor(c: f64) -> Self {
        ExpKernel {
            a: vec![C64::new(1.0, 0.0)],
            c: vec![C64::new(c, 0.0)],
        }
    }

    /// Number of exponential terms.
    pub fn len(&self) -> usize {
        self.a.len()
    }

    /// Whether the kernel has no terms (never true for constructed kernels).
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    /// Evaluate the kernel at a time in ms. Causal: zero for `t < 0`.
    pub fn eval(&self, t: f64) -> f64 {
        if t < 0.0 {
            return 0.0;
        }
        self.a
            .iter()
            .zip(&self.c)
            .map(|(&a, &c)| (c * (-a * t).exp()).re)
            .sum()
    }

    /// Evaluate the kernel on a time array (ms).
    pub fn eval_many(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|&t| self.eval(t)).collect()
    }

    /// Total surface under the kernel, `Σ c/a` (MΩ): the quasi-static
    /// impedance the kernel represents.
    pub fn k_bar(&self) -> f64 {
        self.a
            .iter()
            .zip(&self.c)
            .map(|(&a, &c)| (c / a).re)
            .sum()
    }

    /// Kernel of the time derivative, `k'(t) = Σ (-a c) e^{-a t}`.
    pub fn derivative(&self) -> ExpKernel {
        ExpKernel {
            a: self.a.clone(),
            c: self.a.iter().zip(&self.c).map(|(&a, &c)| -a * c).collect(),
        }
    }

    /// Evaluate the kernel in the frequency domain at complex `s` (rad/s):
    /// `Σ c·1e3 / (a·1e3 + s)` (MΩ).
    pub fn ft(&self, s: C64) -> C64 {
        self.a
            .iter()
            .zip(&self.c)
            .map(|(&a, &c)| c * 1e3 / (a * 1e3 + s))
            .sum()
    }

    /// Rescale prefactors so that `k_bar` equals `target` (MΩ).
    pub fn normalize_k_bar(&mut self, target: f64) -> Result<()> {
        let current = self.k_bar();
        if current.abs() < 1e-300 {
            return Err(SolverError::InvalidInput(
                "cannot normalize a kernel with vanishing surface".into(),
            ));
        }
        let factor = target / current;
        for c in &mut self.c {
            *c *= factor;
        }
        Ok(())
    }

    /// Linear least-squares refit of the prefactors against sampled kernel
    /// values on the fixed rate basis. Rates must be real; optional weights
    /// apply per sample.
    pub fn fit_prefactors(
        &mut self,
        times: &[f64],
        values: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<()> {
        if times.len() != values.len() || times.is_empty() {
            return Err(SolverError::InvalidInput(
                "prefactor fit needs matching, non-empty sample arrays".into(),
            ));
        }
        if self.a.iter().any(|a| a.im.abs() > 1e-12) {
            return Err(SolverError::InvalidInput(
                "prefactor refit requires a real rate basis".into(),
            ));
        }
        let n = times.len();
        let m = self.a.len();
        let mut design = DMatrix::<f64>::zeros(n, m);
        let mut rhs = DVector::<f64>::zeros(n);
        for (i, &t) in times.iter().enumerate() {
            let w = weights.map_or(1.0, |ws| ws[i]);
            for (k, &a) in self.a.iter().enumerate() {
                design[(i, k)] = w * (-a.re * t).exp();
            }
            rhs[i] = w * values[i];
        }
        let solution = design
            .svd(true, true)
            .solve(&rhs, 1e-12)
            .map_err(|e| SolverError::InvalidInput(format!("prefactor refit solve failed: {e}")))?;
        self.c = solution.iter().map(|&x| C64::new(x, 0.0)).collect();
        Ok(())
    }

    fn rates_coincide(&self, other: &ExpKernel) -> bool {
        self.a.len() == other.a.len()
            && self
                .a
                .iter()
                .zip(&other.a)
                .all(|(x, y)| (x - y).norm() < RATE_MERGE_TOL)
    }

    fn combine(&self, other: &ExpKernel, sign: f64) -> ExpKernel {
        if self.rates_coincide(other) {
            ExpKernel {
                a: self.a.clone(),
                c: self
                    .c
                    .iter()
                    .zip(&other.c)
                    .map(|(&x, &y)| x + sign * y)
                    .collect(),
            }
        } else {
            let mut a = self.a.clone();
            a.extend_from_slice(&other.a);
            let mut c = self.c.clone();
            c.extend(other.c.iter().map(|&y| sign * y));
            ExpKernel { a, c }
        }
    }
}

impl std::ops::Add for &ExpKernel {
    type Output = ExpKernel;

    fn add(self, other: &ExpKernel) -> ExpKernel {
        self.combine(other, 1.0)
    }
}

impl std::ops::Sub for &ExpKernel {
    type Output = ExpKernel;

    fn sub(self, other: &ExpKernel) -> ExpKernel {
        self.combine(other, -1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_and_surface() {
        let kernel = ExpKernel::from_real(&[1.0, 0.1], &[2.0, 0.5]).unwrap();
        assert!((kernel.eval(0.0) - 2.5).abs() < 1e-12);
        assert_eq!(kernel.eval(-1.0), 0.0);
        assert!((kernel.k_bar() - (2.0 / 1.0 + 0.5 / 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_ft_at_zero_matches_surface() {
        let kernel = ExpKernel::from_real(&[0.5, 2.0], &[1.0, -0.2]).unwrap();
        let z0 = kernel.ft(C64::new(0.0, 0.0));
        assert!((z0.re - kernel.k_bar()).abs() < 1e-12);
        assert!(z0.im.abs() < 1e-15);
    }

    #[test]
    fn test_add_merges_identical_rate_sets() {
        let k1 = ExpKernel::from_real(&[1.0, 2.0], &[1.0, 1.0]).unwrap();
        let k2 = ExpKernel::from_real(&[1.0, 2.0], &[0.5, -0.5]).unwrap();
        let sum = &k1 + &k2;
        assert_eq!(sum.len(), 2);
        assert!((sum.c[0].re - 1.5).abs() < 1e-12);

        let k3 = ExpKernel::from_real(&[3.0], &[1.0]).unwrap();
        let mixed = &k1 + &k3;
        assert_eq!(mixed.len(), 3);
        let diff = &k1 - &k1;
        assert!(diff.k_bar().abs() < 1e-12);
    }

    #[test]
    fn test_derivative() {
        let kernel = ExpKernel::from_real(&[2.0], &[3.0]).unwrap();
        let deriv = kernel.derivative();
        // d/dt 3 e^{-2t} = -6 e^{-2t}
        assert!((deriv.eval(0.5) - (-6.0 * (-1.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_prefactor_refit_recovers_coefficients() {
        let target = ExpKernel::from_real(&[0.2, 1.5], &[4.0, -1.0]).unwrap();
        let times: Vec<f64> = (0..200).map(|i| i as f64 * 0.05).collect();
        let values = target.eval_many(&times);
        let mut kernel = ExpKernel::from_real(&[0.2, 1.5], &[1.0, 1.0]).unwrap();
        kernel.fit_prefactors(&times, &values, None).unwrap();
        assert!((kernel.c[0].re - 4.0).abs() < 1e-6);
        assert!((kernel.c[1].re - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_normalization() {
        let mut kernel = ExpKernel::from_real(&[1.0], &[2.0]).unwrap();
        kernel.normalize_k_bar(10.0).unwrap();
        assert!((kernel.k_bar() - 10.0).abs() < 1e-12);
    }
}
