// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! # Compartment reduction
//!
//! Reduced compartmental models and the fitter that derives them from a
//! full morphology's impedance kernels:
//! - [`comptree`]: the lumped compartment tree and its system/impedance
//!   matrices
//! - [`fd`]: finite-difference discretization of a physiological tree
//! - [`nnls`]: the non-negative least squares used by every fitting stage
//! - [`fitter`]: the staged reduction fit (conductances, reversals,
//!   capacitances, verification)

pub mod comptree;
pub mod error;
pub mod fd;
pub mod fitter;
pub mod nnls;

pub use comptree::{CompartmentCurrent, CompartmentNode, CompartmentTree};
pub use error::{FitError, Result};
pub use fd::finite_difference_tree;
pub use fitter::{CompartmentFitter, FitConfig};
pub use nnls::nnls;
