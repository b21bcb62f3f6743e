// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Concrete channel models.
//!
//! Kinetics and constants follow the standard cortical-neuron literature
//! models (Hay et al. 2011 and the references therein). Rate constants are in
//! 1/ms, time constants in ms, voltages in mV.

use crate::channel::{linoid, sigmoid, Ion, IonChannel};

/// Two-gate calibration channel with voltage-independent kinetics.
///
/// Open probability `0.9·a³·b² + 0.1·c²·d` with constant steady states
/// (0.3, 0.5, 0.4, 0.6); handy for exercising multi-gate bookkeeping in
/// tests without voltage-dependent nonlinearities.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalibrationChannel;

impl IonChannel for CalibrationChannel {
    fn name(&self) -> &str {
        "calibration"
    }

    fn ion(&self) -> Ion {
        Ion::NonSpecific
    }

    fn reversal(&self) -> f64 {
        -23.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["a", "b", "c", "d"]
    }

    fn steady_state(&self, _v: f64) -> Vec<f64> {
        vec![0.3, 0.5, 0.4, 0.6]
    }

    fn time_constants(&self, _v: f64) -> Vec<f64> {
        vec![1.0, 2.0, 2.0, 3.0]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        0.9 * states[0].powi(3) * states[1].powi(2) + 0.1 * states[2].powi(2) * states[3]
    }
}

/// Hyperpolarization-activated cation channel with fast and slow components
/// (Bal & Oertel 2000).
#[derive(Debug, Clone, Copy)]
pub struct Hcn {
    /// Fraction of the slow component.
    pub ratio: f64,
    /// Fast time constant (ms).
    pub tau_fast: f64,
    /// Slow time constant (ms).
    pub tau_slow: f64,
}

impl Default for Hcn {
    fn default() -> Self {
        Hcn {
            ratio: 0.2,
            tau_fast: 40.0,
            tau_slow: 300.0,
        }
    }
}

impl IonChannel for Hcn {
    fn name(&self) -> &str {
        "hcn"
    }

    fn ion(&self) -> Ion {
        Ion::NonSpecific
    }

    fn reversal(&self) -> f64 {
        -43.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["hf", "hs"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        let act = sigmoid(v, -82.0, 7.0);
        vec![act, act]
    }

    fn time_constants(&self, _v: f64) -> Vec<f64> {
        vec![self.tau_fast, self.tau_slow]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        (1.0 - self.ratio) * states[0] + self.ratio * states[1]
    }
}

/// Hcn channel variant (Kole, Hallermann & Stuart 2006).
#[derive(Debug, Default, Clone, Copy)]
pub struct HcnHay;

impl HcnHay {
    fn rates(v: f64) -> (f64, f64) {
        // x / (exp(x/k) - 1) == linoid(-x, k)
        let alpha = 0.001 * 6.43 * linoid(-(v + 154.9), 11.9);
        let beta = 0.001 * 193.0 * (v / 33.1).exp();
        (alpha, beta)
    }
}

impl IonChannel for HcnHay {
    fn name(&self) -> &str {
        "hcn_hay"
    }

    fn ion(&self) -> Ion {
        Ion::NonSpecific
    }

    fn reversal(&self) -> f64 {
        -45.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        let (alpha, beta) = Self::rates(v);
        vec![alpha / (alpha + beta)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        let (alpha, beta) = Self::rates(v);
        vec![1.0 / (alpha + beta)]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0]
    }
}

/// Transient sodium channel `m³h` (Colbert & Pan 2002).
#[derive(Debug, Default, Clone, Copy)]
pub struct NaTa;

impl NaTa {
    fn rates(v: f64) -> (f64, f64, f64, f64) {
        let alpha_m = 0.182 * linoid(v + 38.0, 6.0);
        let beta_m = 0.124 * linoid(-(v + 38.0), 6.0);
        let alpha_h = 0.015 * linoid(-(v + 66.0), 6.0);
        let beta_h = 0.015 * linoid(v + 66.0, 6.0);
        (alpha_m, beta_m, alpha_h, beta_h)
    }
}

impl IonChannel for NaTa {
    fn name(&self) -> &str {
        "na_ta"
    }

    fn ion(&self) -> Ion {
        Ion::Na
    }

    fn reversal(&self) -> f64 {
        50.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m", "h"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        let (am, bm, ah, bh) = Self::rates(v);
        vec![am / (am + bm), ah / (ah + bh)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        let (am, bm, ah, bh) = Self::rates(v);
        vec![(1.0 / 2.95) / (am + bm), (1.0 / 2.95) / (ah + bh)]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0].powi(3) * states[1]
    }
}

/// Fast delayed-rectifier potassium channel (Rettig et al. 1992).
#[derive(Debug, Default, Clone, Copy)]
pub struct Kv31;

impl IonChannel for Kv31 {
    fn name(&self) -> &str {
        "kv3_1"
    }

    fn ion(&self) -> Ion {
        Ion::K
    }

    fn reversal(&self) -> f64 {
        -85.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        vec![sigmoid(v, 18.7, -9.7)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        vec![4.0 / (1.0 + (-(v + 46.56) / 44.14).exp())]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0]
    }
}

/// Persistent potassium channel `m²h` (Korngreen & Sakmann 2000).
#[derive(Debug, Default, Clone, Copy)]
pub struct Kpst;

impl IonChannel for Kpst {
    fn name(&self) -> &str {
        "k_pst"
    }

    fn ion(&self) -> Ion {
        Ion::K
    }

    fn reversal(&self) -> f64 {
        -85.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m", "h"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        vec![sigmoid(v, -11.0, -12.0), sigmoid(v, -64.0, 11.0)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        let tau_m = (3.04
            + 17.3 * (-((v + 60.0) / 15.9).powi(2)).exp()
            + 25.2 * (-((v + 60.0) / 57.4).powi(2)).exp())
            / 2.95;
        let tau_h =
            (360.0 + (1010.0 + 24.0 * (v + 65.0)) * (-((v + 85.0) / 48.0).powi(2)).exp()) / 2.95;
        vec![tau_m, tau_h]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0].powi(2) * states[1]
    }
}

/// Transient potassium channel `m²h` (Korngreen & Sakmann 2000).
#[derive(Debug, Default, Clone, Copy)]
pub struct Ktst;

impl IonChannel for Ktst {
    fn name(&self) -> &str {
        "k_tst"
    }

    fn ion(&self) -> Ion {
        Ion::K
    }

    fn reversal(&self) -> f64 {
        -85.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m", "h"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        vec![sigmoid(v, -10.0, -19.0), sigmoid(v, -76.0, 10.0)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        vec![
            (0.34 + 0.92 * (-((v + 81.0) / 59.0).powi(2)).exp()) / 2.95,
            (8.0 + 49.0 * (-((v + 83.0) / 23.0).powi(2)).exp()) / 2.95,
        ]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0].powi(2) * states[1]
    }
}

/// Muscarinic potassium channel (Adams 1982).
#[derive(Debug, Default, Clone, Copy)]
pub struct KM;

impl KM {
    fn rates(v: f64) -> (f64, f64) {
        let alpha = 3.3e-3 * (0.1 * (v + 35.0)).exp();
        let beta = 3.3e-3 * (-0.1 * (v + 35.0)).exp();
        (alpha, beta)
    }
}

impl IonChannel for KM {
    fn name(&self) -> &str {
        "k_m"
    }

    fn ion(&self) -> Ion {
        Ion::K
    }

    fn reversal(&self) -> f64 {
        -85.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        let (alpha, beta) = Self::rates(v);
        vec![alpha / (alpha + beta)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        let (alpha, beta) = Self::rates(v);
        vec![(1.0 / (alpha + beta)) / 2.95]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0]
    }
}

/// Low-voltage-activated calcium channel `m²h` (Avery & Johnston 1996).
#[derive(Debug, Default, Clone, Copy)]
pub struct CaLva;

impl IonChannel for CaLva {
    fn name(&self) -> &str {
        "ca_lva"
    }

    fn ion(&self) -> Ion {
        Ion::Ca
    }

    fn reversal(&self) -> f64 {
        50.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m", "h"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        vec![sigmoid(v, -40.0, -6.0), sigmoid(v, -90.0, 6.4)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        vec![
            5.0 + 20.0 / (1.0 + ((v + 35.0) / 5.0).exp()) / 2.95,
            20.0 + 50.0 / (1.0 + ((v + 50.0) / 7.0).exp()) / 2.95,
        ]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0].powi(2) * states[1]
    }
}

/// High-voltage-activated calcium channel `m²h` (Reuveni et al. 1993).
#[derive(Debug, Default, Clone, Copy)]
pub struct CaHva;

impl CaHva {
    fn rates(v: f64) -> (f64, f64, f64, f64) {
        let alpha_m = 0.055 * linoid(27.0 + v, 3.8);
        let beta_m = 0.94 * (-(75.0 + v) / 17.0).exp();
        let alpha_h = 0.000457 * (-(13.0 + v) / 50.0).exp();
        let beta_h = 0.0065 / ((-(v + 15.0) / 28.0).exp() + 1.0);
        (alpha_m, beta_m, alpha_h, beta_h)
    }
}

impl IonChannel for CaHva {
    fn name(&self) -> &str {
        "ca_hva"
    }

    fn ion(&self) -> Ion {
        Ion::Ca
    }

    fn reversal(&self) -> f64 {
        50.0
    }

    fn state_names(&self) -> &[&'static str] {
        &["m", "h"]
    }

    fn steady_state(&self, v: f64) -> Vec<f64> {
        let (am, bm, ah, bh) = Self::rates(v);
        vec![am / (am + bm), ah / (ah + bh)]
    }

    fn time_constants(&self, v: f64) -> Vec<f64> {
        let (am, bm, ah, bh) = Self::rates(v);
        vec![1.0 / (am + bm), 1.0 / (ah + bh)]
    }

    fn open_probability(&self, states: &[f64]) -> f64 {
        states[0].powi(2) * states[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_open_probability() {
        let channel = CalibrationChannel;
        let p = channel.open_probability_inf(-75.0);
        let expected = 0.9 * 0.3f64.powi(3) * 0.5f64.powi(2) + 0.1 * 0.4f64.powi(2) * 0.6;
        assert!((p - expected).abs() < 1e-12);
    }

    #[test]
    fn test_gates_stay_in_unit_interval() {
        let channels: Vec<Box<dyn IonChannel>> = vec![
            Box::new(Hcn::default()),
            Box::new(NaTa),
            Box::new(Kv31),
            Box::new(Kpst),
            Box::new(Ktst),
            Box::new(KM),
            Box::new(CaLva),
            Box::new(CaHva),
        ];
        for channel in &channels {
            let mut v = -100.0;
            while v <= 60.0 {
                for (k, x) in channel.steady_state(v).iter().enumerate() {
                    assert!(
                        (0.0..=1.0).contains(x),
                        "{} gate {} out of range at v = {v}: {x}",
                        channel.name(),
                        k
                    );
                }
                for tau in channel.time_constants(v) {
                    assert!(tau > 0.0, "{} has non-positive tau at {v}", channel.name());
                }
                v += 2.5;
            }
        }
    }

    #[test]
    fn test_na_activation_increases_with_voltage() {
        let m_low = NaTa.steady_state(-80.0)[0];
        let m_high = NaTa.steady_state(0.0)[0];
        assert!(m_high > m_low);
        // Inactivation gate goes the other way.
        let h_low = NaTa.steady_state(-80.0)[1];
        let h_high = NaTa.steady_state(0.0)[1];
        assert!(h_high < h_low);
    }

    #[test]
    fn test_hcn_activates_on_hyperpolarization() {
        let p_rest = Hcn::default().open_probability_inf(-60.0);
        let p_hyper = Hcn::default().open_probability_inf(-100.0);
        assert!(p_hyper > p_rest);
    }
}
