// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Error types for tree structure and geometry operations.
//!
//! Structural errors (`NodeNotFound`, `InvalidOperation`) indicate API misuse
//! and are surfaced immediately; `Geometry` indicates malformed input that
//! must be fixed by the caller. None of these are retried.

/// Error type for tree storage, traversal and geometry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TreeError {
    /// The requested node index does not exist in this tree.
    #[error("node {index} not found in tree")]
    NodeNotFound {
        /// Index that failed to resolve.
        index: usize,
    },

    /// The operation is not allowed in the tree's current state.
    #[error("invalid tree operation: {0}")]
    InvalidOperation(String),

    /// A node carries malformed geometry (non-positive radius or length).
    #[error("malformed geometry at node {index}: {detail}")]
    Geometry {
        /// Offending node index.
        index: usize,
        /// Human-readable explanation.
        detail: String,
    },

    /// A location's fractional position lies outside `[0, 1]`.
    #[error("location x = {x} on node {node} outside [0, 1]")]
    LocationOutOfRange {
        /// Node the location refers to.
        node: usize,
        /// Offending fractional position.
        x: f64,
    },

    /// A referenced ion channel is not present in the registry.
    #[error("channel '{0}' not found in registry")]
    UnknownChannel(String),
}

/// Convenience alias used throughout the structures crate.
pub type Result<T> = std::result::Result<T, TreeError>;
