// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! # Tree storage for neuron morphologies
//!
//! One generic tree core backs every tree kind in the workspace; node
//! payloads are composed from independent capability components:
//! - [`tree`]: arena storage, traversal, subtree operations, the scoped
//!   computational view
//! - [`morphology`]: geometry payloads, locations, path metrics, ingestion
//!   of dendritic-morphology interchange records
//! - [`physiology`]: membrane parameters, channel attachment, leak fitting,
//!   passification, computational-node marking
//!
//! Derived tree kinds are created with [`Tree::map_payload`], which
//! deep-copies the topology and rebuilds all links.

pub mod error;
pub mod morphology;
pub mod physiology;
pub mod tree;

pub use error::{Result, TreeError};
pub use morphology::{
    morph_tree_from_records, Geometry, GeometryPayload, Loc, MorphNode, MorphRecord, MorphTree,
    StructureKind, KIND_SOMA, UM,
};
pub use physiology::{
    phys_tree_from_morph, phys_tree_from_records, ChannelDensity, Membrane, MembranePayload,
    PhysNode, PhysTree, LEAK,
};
pub use tree::{ComputationalScope, Tree, TreeNode};
