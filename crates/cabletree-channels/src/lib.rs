// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! # Ion channel kinetics
//!
//! Voltage-gated channel models shared across morphological trees and the
//! kernel solvers:
//! - [`IonChannel`]: the kinetics interface (gating variables, open
//!   probability, linearized admittance, simulator-export description)
//! - [`collection`]: concrete literature channel models
//! - [`ChannelRegistry`]: the explicit per-session channel store

pub mod channel;
pub mod collection;
pub mod registry;

pub use channel::{ChannelDescription, Complex64, Ion, IonChannel};
pub use registry::ChannelRegistry;

/// Errors raised by channel lookup and evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The named channel is not present in the registry.
    #[error("unknown channel '{0}'")]
    Unknown(String),
}
