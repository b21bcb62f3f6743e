// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Windowed inverse-Fourier quadrature.
//!
//! Transfer kernels are converted to the time domain by numerically
//! integrating the inverse Fourier transform over a truncated band. A
//! squared-cosine window suppresses the Gibbs ringing of the hard
//! truncation; the result is a sampled causal kernel rather than a closed
//! form. For a real time-domain kernel the integral reduces to the positive
//! half-band:
//!
//! ```text
//!     k(t) = (1/π) ∫₀^W w(ω) [Re Z(iω) cos(ωt) - Im Z(iω) sin(ωt)] dω
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::QuadratureConfig;
use crate::error::{Result, SolverError};
use crate::kernel::C64;

/// A kernel sampled on a uniform time grid (ms, MΩ/ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledKernel {
    /// Sample times (ms).
    pub times: Vec<f64>,
    /// Kernel values (MΩ/ms).
    pub values: Vec<f64>,
}

impl SampledKernel {
    /// Trapezoidal integral of the kernel (MΩ).
    pub fn integral(&self) -> f64 {
        let mut total = 0.0;
        for i in 1..self.times.len() {
            let dt = self.times[i] - self.times[i - 1];
            total += 0.5 * dt * (self.values[i] + self.values[i - 1]);
        }
        total
    }

    /// Rescale the samples so the kernel integral matches the quasi-static
    /// impedance `z0` (MΩ).
    pub fn normalize_integral(&mut self, z0: f64) -> Result<()> {
        let current = self.integral();
        if current.abs() < 1e-300 {
            return Err(SolverError::InvalidInput(
                "cannot normalize a sampled kernel with vanishing integral".into(),
            ));
        }
        let factor = z0 / current;
        for v in &mut self.values {
            *v *= factor;
        }
        Ok(())
    }
}

/// Squared-cosine window on `[0, omega_max]`.
fn window(omega: f64, omega_max: f64) -> f64 {
    let x = std::f64::consts::FRAC_PI_2 * omega / omega_max;
    x.cos().powi(2)
}

/// Inverse-transform a frequency response to a sampled time-domain kernel.
///
/// `eval` is the frequency response at `s = iω` (MΩ); `times` are the output
/// samples in ms. Output samples are independent and computed in parallel.
pub fn inverse_fourier<F>(
    eval: F,
    times: &[f64],
    config: &QuadratureConfig,
) -> Result<SampledKernel>
where
    F: Fn(C64) -> Result<C64> + Sync,
{
    if times.is_empty() {
        return Err(SolverError::InvalidInput("empty time grid".into()));
    }
    if config.n_freq < 2 || config.omega_max <= 0.0 {
        return Err(SolverError::InvalidInput(format!(
            "bad quadrature band: omega_max = {}, n_freq = {}",
            config.omega_max, config.n_freq
        )));
    }
    let n = config.n_freq;
    let d_omega = config.omega_max / (n - 1) as f64;
    // Windowed spectrum on the uniform grid, computed once.
    let spectrum: Vec<(f64, C64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let omega = i as f64 * d_omega;
            let z = eval(C64::new(0.0, omega))?;
            Ok((omega, z * window(omega, config.omega_max)))
        })
        .collect::<Result<_>>()?;

    let values: Vec<f64> = times
        .par_iter()
        .map(|&t_ms| {
            let t = t_ms * 1e-3;
            let mut total = 0.0;
            for (i, &(omega, z)) in spectrum.iter().enumerate() {
                let weight = if i == 0 || i == n - 1 { 0.5 } else { 1.0 };
                total += weight * (z.re * (omega * t).cos() - z.im * (omega * t).sin());
            }
            // 1/π prefactor; convert MΩ/s to MΩ/ms.
            total * d_omega / std::f64::consts::PI * 1e-3
        })
        .collect();

    Ok(SampledKernel {
        times: times.to_vec(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_exponential_reconstruction() {
        // Z(s) = 1/(s + α), k(t) = e^{-αt}: α = 200 rad/s (τ = 5 ms).
        let alpha = 200.0;
        let config = QuadratureConfig {
            omega_max: 4.0e4,
            n_freq: 8192,
        };
        let times: Vec<f64> = (0..60).map(|i| i as f64 * 0.5).collect();
        let kernel = inverse_fourier(
            |s| Ok(C64::new(1.0, 0.0) / (s + alpha)),
            &times,
            &config,
        )
        .unwrap();
        for (&t, &v) in kernel.times.iter().zip(&kernel.values).skip(2) {
            let expected = 1e-3 * (-alpha * t * 1e-3).exp();
            assert!(
                (v - expected).abs() < 0.02 * 1e-3,
                "t = {t}: {v} vs {expected}"
            );
        }
    }

    #[test]
    fn test_integral_normalization() {
        let alpha = 100.0;
        let config = QuadratureConfig::default();
        let times: Vec<f64> = (0..400).map(|i| i as f64 * 0.25).collect();
        let mut kernel = inverse_fourier(
            |s| Ok(C64::new(3.0, 0.0) / (s + alpha)),
            &times,
            &config,
        )
        .unwrap();
        let z0 = 3.0 / alpha;
        kernel.normalize_integral(z0).unwrap();
        assert!((kernel.integral() - z0).abs() < 1e-12);
    }

    #[test]
    fn test_bad_band_is_rejected() {
        let config = QuadratureConfig {
            omega_max: 0.0,
            n_freq: 16,
        };
        assert!(inverse_fourier(|_| Ok(C64::new(0.0, 0.0)), &[0.0], &config).is_err());
    }
}
