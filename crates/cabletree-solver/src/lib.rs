// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! # Impedance kernel solvers
//!
//! Frequency- and time-domain impulse-response kernels of branched neuron
//! morphologies:
//! - [`greens`]: direct frequency-domain solution of the cable equations on
//!   the tree (arbitrary complex frequencies, frozen or quasi-active
//!   channels)
//! - [`equilibrium`]: operating-point search feeding the linearization
//! - [`sov`]: separation-of-variables eigenmode expansion (poles via
//!   root-finding on the admittance matching condition, modes via the
//!   junction nullspace)
//! - [`vectorfit`] / [`quadrature`]: frequency→time conversion for input
//!   and transfer kernels respectively
//! - [`net`]: the neural evaluation tree derived from a mode expansion
//! - [`cache`]: digest-keyed memoization of solver products

pub mod cache;
pub mod config;
pub mod equilibrium;
pub mod error;
pub mod greens;
pub mod kernel;
pub mod net;
pub mod quadrature;
pub mod sov;
pub mod vectorfit;

pub use cache::{tree_digest, CacheValue, KernelCache};
pub use config::{EquilibriumConfig, QuadratureConfig, SovConfig, VectorFitConfig};
pub use equilibrium::{EquilibriumSolution, EquilibriumSolver};
pub use error::{Result, SolverError};
pub use greens::{ChannelMode, GreensSolver};
pub use kernel::{C64, ExpKernel};
pub use net::{NetNode, NetTree};
pub use quadrature::{inverse_fourier, SampledKernel};
pub use sov::{Eigenmode, ModeExpansion, SovSolver};
pub use vectorfit::{fit_input_kernel, vector_fit, RationalFit};
