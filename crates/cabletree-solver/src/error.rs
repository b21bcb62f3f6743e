// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Error types for the kernel solvers.
//!
//! Numerical failures carry the achieved residual and iteration count so the
//! caller can diagnose budget exhaustion. Convergence failures may be retried
//! once with a relaxed tolerance by the solvers themselves; singular-system
//! and input errors are never retried.

use cabletree_structures::TreeError;

/// Primary error type for kernel-solver operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolverError {
    /// An iterative procedure exhausted its iteration budget.
    #[error(
        "{context}: no convergence after {iterations} iterations (residual={residual:.3e}, tol={tolerance:.3e})"
    )]
    Convergence {
        /// Which procedure failed.
        context: &'static str,
        /// Iterations completed before giving up.
        iterations: usize,
        /// Final residual at termination.
        residual: f64,
        /// Target tolerance that was not reached.
        tolerance: f64,
    },

    /// The coupling system is singular (degenerate or disconnected tree).
    #[error("singular system: {detail}")]
    SingularSystem {
        /// Human-readable explanation.
        detail: String,
    },

    /// A rational or kernel fit failed to reach tolerance with stable poles.
    #[error(
        "kernel fit failed: residual {residual:.3e} above tolerance {tolerance:.3e} after {iterations} iterations; {remedy}"
    )]
    FitFailure {
        /// Achieved fit residual.
        residual: f64,
        /// Requested tolerance.
        tolerance: f64,
        /// Iterations (including order retries) spent.
        iterations: usize,
        /// Suggested remedy.
        remedy: &'static str,
    },

    /// Invalid solver input (empty grids, mismatched lengths, bad modes).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Underlying tree/geometry error.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Convenience alias used throughout the solver crate.
pub type Result<T> = std::result::Result<T, SolverError>;
