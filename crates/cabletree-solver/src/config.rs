// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Solver configuration.
//!
//! Every tolerance and iteration budget of the numerical procedures is an
//! explicit, serializable parameter with a documented default; none are
//! hard-coded in the algorithms.

use serde::{Deserialize, Serialize};

/// Configuration of the equilibrium (operating-point) solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibriumConfig {
    /// Residual infinity-norm (µA scale) below which the Newton iteration is
    /// considered converged.
    pub tolerance: f64,
    /// Maximum Newton iterations per attempt.
    pub max_iterations: usize,
    /// Newton step damping factor in `(0, 1]`.
    pub damping: f64,
    /// Tolerance relaxation factor applied on the single retry.
    pub retry_relaxation: f64,
}

impl Default for EquilibriumConfig {
    fn default() -> Self {
        EquilibriumConfig {
            tolerance: 1e-9,
            max_iterations: 100,
            damping: 1.0,
            retry_relaxation: 10.0,
        }
    }
}

/// Configuration of the separation-of-variables eigenmode solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SovConfig {
    /// Lower end of the pole scan (rad/s).
    pub alpha_min: f64,
    /// Upper end of the pole scan (rad/s); bounds the number of recovered
    /// time scales.
    pub alpha_max: f64,
    /// Grid points of the characteristic-function scan (uniform in √α, since
    /// cable eigenvalues crowd quadratically).
    pub scan_points: usize,
    /// Hard cap on the number of eigenmodes kept.
    pub max_modes: usize,
    /// Relative α tolerance of the bisection refinement.
    pub bisection_tolerance: f64,
    /// Maximum bisection iterations per bracket.
    pub max_bisection_iterations: usize,
    /// Probe the input admittance at every leaf tip in addition to the soma,
    /// to catch modes with a voltage node at the soma.
    pub probe_leaves: bool,
    /// Modes whose nullspace is not well separated (σ_min/σ_max above this)
    /// are discarded.
    pub nullspace_tolerance: f64,
}

impl Default for SovConfig {
    fn default() -> Self {
        SovConfig {
            alpha_min: 1.0,
            alpha_max: 2.0e5,
            scan_points: 3000,
            max_modes: 60,
            bisection_tolerance: 1e-12,
            max_bisection_iterations: 200,
            probe_leaves: true,
            nullspace_tolerance: 1e-5,
        }
    }
}

/// Configuration of the vector-fitting rational approximation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorFitConfig {
    /// Initial number of poles.
    pub n_poles: usize,
    /// Pole-relocation iterations per attempt.
    pub max_iterations: usize,
    /// Relative RMS residual below which the fit is accepted.
    pub tolerance: f64,
    /// Number of retries with increased order before failing.
    pub max_order_retries: usize,
    /// Poles added per retry.
    pub order_step: usize,
}

impl Default for VectorFitConfig {
    fn default() -> Self {
        VectorFitConfig {
            n_poles: 8,
            max_iterations: 30,
            tolerance: 1e-4,
            max_order_retries: 3,
            order_step: 4,
        }
    }
}

/// Configuration of the windowed inverse-Fourier quadrature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadratureConfig {
    /// Truncation frequency of the integral (rad/s).
    pub omega_max: f64,
    /// Number of frequency samples on `[0, omega_max]`.
    pub n_freq: usize,
}

impl Default for QuadratureConfig {
    fn default() -> Self {
        QuadratureConfig {
            omega_max: 2.0e5,
            n_freq: 4096,
        }
    }
}
