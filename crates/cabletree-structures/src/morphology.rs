// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Morphological capability: geometry payloads, locations and path metrics.
//!
//! Geometry is stored per node; the segment associated with a node runs from
//! its parent's position (proximal) to the node's own position (distal). The
//! root represents the soma as a lumped sphere of the root radius and has no
//! segment of its own.
//!
//! All lengths are in cm internally; the morphology interchange interface
//! accepts µm and converts on ingestion.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};
use crate::tree::Tree;

/// µm → cm.
pub const UM: f64 = 1e-4;

/// Per-node geometry: position of the node's distal point and its radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Position of the node's distal point (cm).
    pub xyz: [f64; 3],
    /// Segment radius (root: soma sphere radius), cm.
    pub radius: f64,
}

/// Payload kinds that expose geometry, enabling the generic morphology API.
pub trait GeometryPayload {
    /// Immutable access to the node's geometry.
    fn geometry(&self) -> &Geometry;
    /// Mutable access to the node's geometry.
    fn geometry_mut(&mut self) -> &mut Geometry;
}

/// Structure-type tag from the morphology interchange format.
pub type StructureKind = u8;

/// Soma structure kind.
pub const KIND_SOMA: StructureKind = 1;

/// Morphology-only node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MorphNode {
    /// Node index in the source record stream (may be sparse).
    pub source_index: i64,
    /// Structure kind (1 soma, 2 axon, 3 basal, 4 apical, ...).
    pub kind: StructureKind,
    /// Geometry component.
    pub geometry: Geometry,
}

impl GeometryPayload for MorphNode {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn geometry_mut(&mut self) -> &mut Geometry {
        &mut self.geometry
    }
}

/// Tree of morphological nodes.
pub type MorphTree = Tree<MorphNode>;

/// One record of the dendritic-morphology interchange format:
/// `(index, type, x, y, z, radius, parent_index)`, coordinates in µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MorphRecord {
    /// Record index (unique, arbitrary positive integers).
    pub index: i64,
    /// Structure kind.
    pub kind: StructureKind,
    /// X position (µm).
    pub x: f64,
    /// Y position (µm).
    pub y: f64,
    /// Z position (µm).
    pub z: f64,
    /// Radius (µm).
    pub radius: f64,
    /// Parent record index, `-1` for the root.
    pub parent: i64,
}

/// Build a [`MorphTree`] from interchange records.
///
/// Records must list the root (parent `-1`) before its descendants and each
/// parent before its children. Fails with [`TreeError::Geometry`] for
/// non-positive radii or zero-length non-root segments, and with
/// [`TreeError::InvalidOperation`] for duplicate indices, missing parents or
/// multiple roots.
pub fn morph_tree_from_records(records: &[MorphRecord]) -> Result<MorphTree> {
    let mut tree: Option<MorphTree> = None;
    // source record index -> tree node index
    let mut by_source: AHashMap<i64, usize> = AHashMap::new();
    for record in records {
        if by_source.contains_key(&record.index) {
            return Err(TreeError::InvalidOperation(format!(
                "duplicate morphology record index {}",
                record.index
            )));
        }
        if record.radius <= 0.0 {
            return Err(TreeError::Geometry {
                index: by_source.len(),
                detail: format!(
                    "record {} has non-positive radius {}",
                    record.index, record.radius
                ),
            });
        }
        let payload = MorphNode {
            source_index: record.index,
            kind: record.kind,
            geometry: Geometry {
                xyz: [record.x * UM, record.y * UM, record.z * UM],
                radius: record.radius * UM,
            },
        };
        if record.parent < 0 {
            if tree.is_some() {
                return Err(TreeError::InvalidOperation(format!(
                    "record {} declares a second root",
                    record.index
                )));
            }
            let t = MorphTree::new(payload);
            by_source.insert(record.index, t.root_index());
            tree = Some(t);
        } else {
            let tree = tree.as_mut().ok_or_else(|| {
                TreeError::InvalidOperation("no root record before descendants".into())
            })?;
            let &parent_idx = by_source.get(&record.parent).ok_or_else(|| {
                TreeError::InvalidOperation(format!(
                    "record {} references unknown parent {}",
                    record.index, record.parent
                ))
            })?;
            let node_idx = tree.insert(parent_idx, payload)?;
            by_source.insert(record.index, node_idx);
            if tree.segment_length(node_idx)? <= 0.0 {
                return Err(TreeError::Geometry {
                    index: node_idx,
                    detail: format!("record {} defines a zero-length segment", record.index),
                });
            }
        }
    }
    tree.ok_or_else(|| TreeError::InvalidOperation("empty morphology record stream".into()))
}

/// A position on the tree: a node plus a fractional offset along its segment
/// (0 = proximal end at the parent, 1 = distal end at the node itself).
///
/// On the root (soma) the fraction is ignored and the location denotes the
/// soma point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Loc {
    /// Node index.
    pub node: usize,
    /// Fractional position along the node's segment, in `[0, 1]`.
    pub x: f64,
}

impl Loc {
    /// Location at a node's distal point.
    pub fn distal(node: usize) -> Self {
        Loc { node, x: 1.0 }
    }

    /// Location at a node's segment midpoint.
    pub fn mid(node: usize) -> Self {
        Loc { node, x: 0.5 }
    }
}

impl<T: GeometryPayload> Tree<T> {
    /// Length of a node's segment (cm); 0 for the root sphere.
    pub fn segment_length(&self, index: usize) -> Result<f64> {
        let node = self.find(index)?;
        // The fine-grained parent defines the segment even under a coarse view.
        match node.parent() {
            None => Ok(0.0),
            Some(parent) => {
                let a = self.payload(index)?.geometry().xyz;
                let b = self.payload(parent)?.geometry().xyz;
                let d2 = (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2);
                Ok(d2.sqrt())
            }
        }
    }

    /// Membrane area of a node (cm²): cylinder side wall, soma sphere for the
    /// root.
    pub fn membrane_area(&self, index: usize) -> Result<f64> {
        let radius = self.payload(index)?.geometry().radius;
        if self.is_root(index) {
            Ok(4.0 * std::f64::consts::PI * radius * radius)
        } else {
            Ok(2.0 * std::f64::consts::PI * radius * self.segment_length(index)?)
        }
    }

    /// Validate a location's node and fractional position.
    pub fn check_loc(&self, loc: Loc) -> Result<()> {
        self.find(loc.node)?;
        if !(0.0..=1.0).contains(&loc.x) || !loc.x.is_finite() {
            return Err(TreeError::LocationOutOfRange {
                node: loc.node,
                x: loc.x,
            });
        }
        Ok(())
    }

    /// Path length between two locations along the tree (cm).
    pub fn path_length(&self, a: Loc, b: Loc) -> Result<f64> {
        self.check_loc(a)?;
        self.check_loc(b)?;
        if a.node == b.node {
            return Ok((a.x - b.x).abs() * self.segment_length(a.node)?);
        }
        let lca = self.lowest_common_ancestor(a.node, b.node)?;
        // Distance from a location up to the distal point of `stop`, walking
        // proximally. `stop` must be an ancestor of (or equal to) loc.node.
        let climb = |loc: Loc, stop: usize| -> Result<f64> {
            if loc.node == stop {
                // The target point sits further down this very segment.
                return Ok(0.0);
            }
            let mut dist = loc.x * self.segment_length(loc.node)?;
            let mut current = self
                .parent_of(loc.node)?
                .expect("loc.node differs from its ancestor");
            while current != stop {
                dist += self.segment_length(current)?;
                current = self
                    .parent_of(current)?
                    .expect("walk towards an ancestor cannot pass the root");
            }
            Ok(dist)
        };
        if lca == a.node {
            // b lies in a's subtree: meet at a's position on its own segment.
            Ok(climb(b, a.node)? + (1.0 - a.x) * self.segment_length(a.node)?)
        } else if lca == b.node {
            Ok(climb(a, b.node)? + (1.0 - b.x) * self.segment_length(b.node)?)
        } else {
            Ok(climb(a, lca)? + climb(b, lca)?)
        }
    }

    /// Path length from a location to the soma (root) point.
    pub fn distance_to_soma(&self, loc: Loc) -> Result<f64> {
        self.path_length(loc, Loc { node: self.root_index(), x: 1.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// T-shaped morphology (µm coordinates):
    ///
    /// ```text
    ///   soma(1) -- 4 -- 5 -- 6
    ///              |
    ///              7 -- 8
    /// ```
    pub(crate) fn t_records() -> Vec<MorphRecord> {
        vec![
            MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 10.0, parent: -1 },
            MorphRecord { index: 4, kind: 4, x: 100.0, y: 0.0, z: 0.0, radius: 1.0, parent: 1 },
            MorphRecord { index: 5, kind: 4, x: 100.0, y: 50.0, z: 0.0, radius: 1.0, parent: 4 },
            MorphRecord { index: 6, kind: 4, x: 100.0, y: 100.0, z: 0.0, radius: 0.5, parent: 5 },
            MorphRecord { index: 7, kind: 4, x: 100.0, y: -50.0, z: 0.0, radius: 1.0, parent: 4 },
            MorphRecord { index: 8, kind: 4, x: 100.0, y: -100.0, z: 0.0, radius: 0.5, parent: 7 },
        ]
    }

    #[test]
    fn test_records_build_topology() {
        let tree = morph_tree_from_records(&t_records()).unwrap();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.leaves().len(), 2);
        let root = tree.find(tree.root_index()).unwrap();
        assert_eq!(root.payload.kind, KIND_SOMA);
        assert!((tree.segment_length(1).unwrap() - 100.0 * UM).abs() < 1e-12);
    }

    #[test]
    fn test_nonpositive_radius_is_geometry_error() {
        let mut records = t_records();
        records[3].radius = 0.0;
        assert!(matches!(
            morph_tree_from_records(&records),
            Err(TreeError::Geometry { .. })
        ));
    }

    #[test]
    fn test_path_length() {
        let tree = morph_tree_from_records(&t_records()).unwrap();
        // Leaf 6 to leaf 8: 50 + 50 + 50 + 50 µm.
        let d = tree
            .path_length(Loc::distal(3), Loc::distal(5))
            .unwrap();
        assert!((d - 200.0 * UM).abs() < 1e-12);
        // Midpoint of node 4's segment to the soma: 100 + 25 µm.
        let d = tree.distance_to_soma(Loc::mid(2)).unwrap();
        assert!((d - 125.0 * UM).abs() < 1e-12);
        // Ancestor-descendant pair with fractional endpoints.
        let d = tree
            .path_length(Loc { node: 1, x: 0.25 }, Loc { node: 2, x: 0.5 })
            .unwrap();
        assert!((d - (75.0 + 25.0) * UM).abs() < 1e-12);
    }

    #[test]
    fn test_loc_validation() {
        let tree = morph_tree_from_records(&t_records()).unwrap();
        assert!(tree.check_loc(Loc { node: 2, x: 1.5 }).is_err());
        assert!(tree.check_loc(Loc { node: 42, x: 0.5 }).is_err());
    }
}
