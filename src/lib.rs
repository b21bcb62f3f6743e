// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! # Cabletree - impedance kernels and compartmental reduction
//!
//! Cabletree models branched neuron morphologies as trees of electrical
//! compartments, computes their linear impulse-response (impedance) kernels
//! and reduces detailed morphologies to compact compartmental models with
//! matching transfer properties.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! cabletree = "0.1"
//! ```
//!
//! ```no_run
//! use cabletree::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Morphology from interchange records, electrical parameters on top.
//! let records = vec![
//!     MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 8.0, parent: -1 },
//!     MorphRecord { index: 2, kind: 3, x: 120.0, y: 0.0, z: 0.0, radius: 1.0, parent: 1 },
//! ];
//! let mut tree = phys_tree_from_records(&records)?;
//! tree.set_physiology(1.0, 100.0e-6)?;
//! tree.set_leak(100.0, -75.0)?;
//!
//! // Impedance kernels in the frequency domain.
//! let registry = ChannelRegistry::new();
//! let solver = GreensSolver::new(&tree, &registry)?;
//! let locs = [Loc { node: 0, x: 1.0 }, Loc::distal(1)];
//! let z = solver.impedance(locs[0], locs[1], C64::new(0.0, 0.0))?;
//! println!("transfer impedance: {} MΩ", z.re);
//!
//! // Reduce to a two-compartment model with matching kernels.
//! let ctree = CompartmentFitter::new(&tree, &registry).fit_model(&locs)?;
//! assert_eq!(ctree.n_compartments(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - [`cabletree_structures`]: generic tree storage with morphological and
//!   physiological capabilities and the scoped computational view
//! - [`cabletree_channels`]: ion-channel kinetics and the channel registry
//! - [`cabletree_solver`]: Green's-function and separation-of-variables
//!   kernel solvers, time-domain conversion, the kernel cache
//! - [`cabletree_fit`]: compartment trees and the reduction fitter

pub use cabletree_channels as channels;
pub use cabletree_fit as fit;
pub use cabletree_solver as solver;
pub use cabletree_structures as structures;

/// Convenience re-exports of the commonly used types.
pub mod prelude {
    pub use cabletree_channels::{ChannelRegistry, Ion, IonChannel};
    pub use cabletree_fit::{
        finite_difference_tree, CompartmentFitter, CompartmentTree, FitConfig, FitError,
    };
    pub use cabletree_solver::{
        fit_input_kernel, inverse_fourier, tree_digest, ChannelMode, EquilibriumSolver,
        ExpKernel, GreensSolver, KernelCache, NetTree, SovConfig, SovSolver, SolverError, C64,
    };
    pub use cabletree_structures::{
        morph_tree_from_records, phys_tree_from_records, Loc, MorphRecord, MorphTree, PhysTree,
        Tree, TreeError,
    };
}
