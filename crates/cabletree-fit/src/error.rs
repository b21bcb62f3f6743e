// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Error types for compartment reduction.

use cabletree_solver::SolverError;
use cabletree_structures::TreeError;

/// Primary error type for compartment trees and the reduction fitter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FitError {
    /// The reduction could not reproduce the target kernels within
    /// tolerance; carries the achieved residual and a suggested remedy.
    #[error(
        "compartment fit failed: residual {residual:.3e} above tolerance {tolerance:.3e} after {iterations} iterations; {remedy}"
    )]
    FitFailure {
        /// Achieved relative residual.
        residual: f64,
        /// Requested tolerance.
        tolerance: f64,
        /// Iterations spent.
        iterations: usize,
        /// Suggested remedy.
        remedy: String,
    },

    /// The requested location set does not define a valid reduction.
    #[error("invalid location set: {0}")]
    InvalidLocations(String),

    /// Underlying kernel-solver error.
    #[error(transparent)]
    Solver(#[from] SolverError),

    /// Underlying tree/geometry error.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Convenience alias used throughout the fit crate.
pub type Result<T> = std::result::Result<T, FitError>;
