// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! The ion-channel kinetics interface.
//!
//! A channel is a reusable, read-only description of a voltage-dependent
//! conductance: a set of gating variables with first-order relaxation
//! dynamics
//!
//! ```text
//!     dx_k/dt = (x_k∞(v) - x_k) / τ_k(v)
//! ```
//!
//! and an open probability assembled from the gate states. Channels are
//! attached to tree nodes by name with a density (µS/cm²) and reversal
//! potential (mV); the channel objects themselves are shared through a
//! [`crate::ChannelRegistry`].
//!
//! Linearization around an operating voltage turns a channel into a
//! frequency-dependent admittance, which is what the kernel solvers consume.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Complex double used for admittances.
pub type Complex64 = Complex<f64>;

/// Step used for numerical gate-state derivatives.
const STATE_STEP: f64 = 1e-5;
/// Step (mV) used for numerical voltage derivatives.
const VOLTAGE_STEP: f64 = 1e-3;

/// Ion species carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ion {
    /// Unspecific / mixed current.
    NonSpecific,
    /// Sodium.
    Na,
    /// Potassium.
    K,
    /// Calcium.
    Ca,
}

/// Voltage- and state-dependent conductance description.
///
/// Implementations must be pure: all methods are deterministic functions of
/// their arguments, so channel objects can be shared read-only across
/// threads.
pub trait IonChannel: Send + Sync {
    /// Unique channel name used as the attachment key on tree nodes.
    fn name(&self) -> &str;

    /// Ion species of the carried current.
    fn ion(&self) -> Ion;

    /// Suggested reversal potential (mV).
    fn reversal(&self) -> f64;

    /// Names of the gating variables, fixed order.
    fn state_names(&self) -> &[&'static str];

    /// Steady-state gate values `x_k∞(v)`.
    fn steady_state(&self, v: f64) -> Vec<f64>;

    /// Gate relaxation time constants `τ_k(v)` (ms).
    fn time_constants(&self, v: f64) -> Vec<f64>;

    /// Open probability as a function of the gate states.
    fn open_probability(&self, states: &[f64]) -> f64;

    /// Open probability with all gates at steady state.
    fn open_probability_inf(&self, v: f64) -> f64 {
        self.open_probability(&self.steady_state(v))
    }

    /// Conductance fraction of a channel frozen at its operating point
    /// (per unit maximal conductance).
    fn frozen_conductance(&self, v: f64) -> f64 {
        self.open_probability_inf(v)
    }

    /// Voltage derivative of the steady-state open probability,
    /// `d p∞ / dv` (1/mV).
    fn open_probability_slope(&self, v: f64) -> f64 {
        (self.open_probability_inf(v + VOLTAGE_STEP) - self.open_probability_inf(v - VOLTAGE_STEP))
            / (2.0 * VOLTAGE_STEP)
    }

    /// Linearized admittance around the operating voltage `v`, per unit
    /// maximal conductance, at complex frequency `s` (rad/s):
    ///
    /// ```text
    ///     y(s) = p∞(v) + (v - e) Σ_k (∂p/∂x_k) x_k∞'(v) / (1 + s τ_k(v))
    /// ```
    fn linearized_admittance(&self, v: f64, e_rev: f64, s: Complex64) -> Complex64 {
        let states = self.steady_state(v);
        let taus = self.time_constants(v);
        let states_up = self.steady_state(v + VOLTAGE_STEP);
        let states_dn = self.steady_state(v - VOLTAGE_STEP);
        let mut y = Complex64::new(self.open_probability(&states), 0.0);
        let driving = v - e_rev;
        let mut perturbed = states.clone();
        for k in 0..states.len() {
            let x0 = states[k];
            perturbed[k] = x0 + STATE_STEP;
            let p_up = self.open_probability(&perturbed);
            perturbed[k] = x0 - STATE_STEP;
            let p_dn = self.open_probability(&perturbed);
            perturbed[k] = x0;
            let dp_dx = (p_up - p_dn) / (2.0 * STATE_STEP);
            let dxinf_dv = (states_up[k] - states_dn[k]) / (2.0 * VOLTAGE_STEP);
            // τ is in ms, s in rad/s.
            let denom = Complex64::new(1.0, 0.0) + s * (taus[k] * 1e-3);
            y += driving * dp_dx * dxinf_dv / denom;
        }
        y
    }

    /// Serializable export of the channel kinetics for simulator code
    /// generators.
    fn description(&self) -> ChannelDescription {
        let grid: Vec<f64> = (0..DESCRIPTION_GRID_POINTS)
            .map(|i| DESCRIPTION_V_MIN + i as f64 * DESCRIPTION_V_STEP)
            .collect();
        let steady_state = grid.iter().map(|&v| self.steady_state(v)).collect();
        let time_constants = grid.iter().map(|&v| self.time_constants(v)).collect();
        ChannelDescription {
            name: self.name().to_string(),
            ion: self.ion(),
            reversal: self.reversal(),
            state_names: self.state_names().iter().map(|s| s.to_string()).collect(),
            voltage_grid: grid,
            steady_state,
            time_constants,
        }
    }
}

const DESCRIPTION_V_MIN: f64 = -100.0;
const DESCRIPTION_V_STEP: f64 = 0.5;
const DESCRIPTION_GRID_POINTS: usize = 361; // -100 .. +80 mV

/// Tabulated channel kinetics: the export surface consumed by external
/// simulator code generators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescription {
    /// Channel name.
    pub name: String,
    /// Ion species.
    pub ion: Ion,
    /// Suggested reversal potential (mV).
    pub reversal: f64,
    /// Gate variable names.
    pub state_names: Vec<String>,
    /// Voltage grid (mV) the tables below are sampled on.
    pub voltage_grid: Vec<f64>,
    /// Steady-state gate values per grid voltage.
    pub steady_state: Vec<Vec<f64>>,
    /// Gate time constants (ms) per grid voltage.
    pub time_constants: Vec<Vec<f64>>,
}

/// `x / (1 - exp(-x / k))`, stable through the removable singularity at
/// `x = 0` (limit `k`).
pub(crate) fn linoid(x: f64, k: f64) -> f64 {
    let r = x / k;
    if r.abs() < 1e-6 {
        k * (1.0 + r / 2.0)
    } else {
        x / (1.0 - (-r).exp())
    }
}

/// Logistic activation `1 / (1 + exp((v - v_half) / k))`.
pub(crate) fn sigmoid(v: f64, v_half: f64, k: f64) -> f64 {
    1.0 / (1.0 + ((v - v_half) / k).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CalibrationChannel, Kv31};

    #[test]
    fn test_linoid_limit() {
        assert!((linoid(1e-9, 6.0) - 6.0).abs() < 1e-6);
        let x = 2.0;
        assert!((linoid(x, 6.0) - x / (1.0 - (-x / 6.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_linearized_admittance_matches_total_conductance_at_zero() {
        let channel = Kv31::default();
        let v = -60.0;
        let e = channel.reversal();
        let y0 = channel.linearized_admittance(v, e, Complex64::new(0.0, 0.0));
        // At s = 0 the linearization equals the total differential
        // conductance p∞ + (v - e) dp∞/dv.
        let expected = channel.open_probability_inf(v) + (v - e) * channel.open_probability_slope(v);
        assert!((y0.re - expected).abs() < 1e-6);
        assert!(y0.im.abs() < 1e-12);
    }

    #[test]
    fn test_linearization_decays_with_frequency() {
        let channel = Kv31::default();
        let v = -60.0;
        let e = channel.reversal();
        let y0 = channel.linearized_admittance(v, e, Complex64::new(0.0, 0.0));
        let y_inf = channel.linearized_admittance(v, e, Complex64::new(0.0, 1e7));
        // At high frequency the gates cannot follow: only p∞ remains.
        assert!((y_inf.re - channel.open_probability_inf(v)).abs() < 1e-3);
        assert!((y0.re - y_inf.re).abs() > 1e-6);
    }

    #[test]
    fn test_description_roundtrip() {
        let channel = CalibrationChannel::default();
        let description = channel.description();
        let json = serde_json::to_string(&description).unwrap();
        let back: ChannelDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, channel.name());
        assert_eq!(back.state_names.len(), channel.state_names().len());
        assert_eq!(back.voltage_grid.len(), back.steady_state.len());
    }
}
