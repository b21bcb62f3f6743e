// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Reduced compartmental models.
//!
//! A compartment tree is a small tree of lumped compartments: each node
//! carries an absolute capacitance (µF), membrane currents (µS) and a
//! coupling conductance to its parent (µS). It is created by the reduction
//! fitter (or the finite-difference builder) and is independent of the
//! originating morphology. Its impedance matrix is the inverse of the system
//! matrix
//!
//! ```text
//!     G(s) = diag(ca·s + Σ currents + couplings) - couplings
//! ```
//!
//! evaluated with the same frozen/quasi-active channel models as the full
//! tree.

use ahash::AHashMap;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use cabletree_channels::ChannelRegistry;
use cabletree_solver::{C64, ChannelMode, SolverError};
use cabletree_structures::{Loc, MembranePayload, Tree, TreeError};

use crate::error::{FitError, Result};

/// One membrane current of a compartment: absolute conductance and
/// reversal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompartmentCurrent {
    /// Maximal conductance (µS).
    pub g: f64,
    /// Reversal potential (mV).
    pub e: f64,
}

/// Name of the lumped leak current.
pub const LEAK: &str = cabletree_structures::LEAK;

/// Payload of a compartment node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentNode {
    /// Index of the location this compartment represents, in the fitted
    /// location list (also its row/column in the impedance matrix).
    pub loc_idx: usize,
    /// Capacitance (µF).
    pub ca: f64,
    /// Coupling conductance to the parent compartment (µS; 0 at the root).
    pub g_c: f64,
    /// Membrane currents by channel name.
    pub currents: AHashMap<String, CompartmentCurrent>,
    /// Expansion (equilibrium) potential (mV).
    pub v_ep: f64,
}

impl CompartmentNode {
    /// Empty compartment for a location index.
    pub fn empty(loc_idx: usize) -> Self {
        CompartmentNode {
            loc_idx,
            ca: 0.0,
            g_c: 0.0,
            currents: AHashMap::new(),
            v_ep: -75.0,
        }
    }
}

/// Reduced tree of lumped compartments.
#[derive(Debug, Clone)]
pub struct CompartmentTree {
    tree: Tree<CompartmentNode>,
}

impl CompartmentTree {
    /// Wrap an explicitly built compartment tree.
    pub fn from_tree(tree: Tree<CompartmentNode>) -> Self {
        CompartmentTree { tree }
    }

    /// Underlying tree storage.
    pub fn tree(&self) -> &Tree<CompartmentNode> {
        &self.tree
    }

    /// Mutable access to the underlying tree.
    pub fn tree_mut(&mut self) -> &mut Tree<CompartmentNode> {
        &mut self.tree
    }

    /// Number of compartments.
    pub fn n_compartments(&self) -> usize {
        self.tree.len()
    }

    /// Derive the reduced topology from a location set on a morphology:
    /// each location's parent compartment is the nearest other location on
    /// its path to the root.
    ///
    /// Exactly one location must have no other location proximal to it (the
    /// reduced root); overlapping duplicate locations are rejected.
    pub fn from_locations<T: MembranePayload>(tree: &Tree<T>, locs: &[Loc]) -> Result<Self> {
        if locs.is_empty() {
            return Err(FitError::InvalidLocations("empty location set".into()));
        }
        for &loc in locs {
            tree.check_loc(loc)?;
        }

        // Fine ancestors of every location's node.
        let ancestors = |mut index: usize| -> Result<Vec<usize>> {
            let mut path = Vec::new();
            while let Some(parent) = tree.find(index)?.parent() {
                path.push(parent);
                index = parent;
            }
            Ok(path)
        };

        // For each location find its proximal neighbour among the others.
        let mut parent_of: Vec<Option<usize>> = vec![None; locs.len()];
        for (i, &loc) in locs.iter().enumerate() {
            let line: Vec<usize> = ancestors(loc.node)?;
            let mut best: Option<(usize, f64)> = None;
            for (j, &other) in locs.iter().enumerate() {
                if i == j {
                    continue;
                }
                let proximal = if other.node == loc.node {
                    if (other.x - loc.x).abs() < 1e-12 {
                        return Err(FitError::InvalidLocations(format!(
                            "duplicate locations {i} and {j}"
                        )));
                    }
                    other.x < loc.x
                } else {
                    line.contains(&other.node)
                };
                if proximal {
                    let d = tree.path_length(loc, other)?;
                    if best.map_or(true, |(_, bd)| d < bd) {
                        best = Some((j, d));
                    }
                }
            }
            parent_of[i] = best.map(|(j, _)| j);
        }

        let roots: Vec<usize> = parent_of
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .collect();
        if roots.len() != 1 {
            return Err(FitError::InvalidLocations(format!(
                "location set must have exactly one proximal root, found {}",
                roots.len()
            )));
        }

        // Insert in ascending distance to the soma so parents come first.
        let mut order: Vec<usize> = (0..locs.len()).collect();
        let mut dist = vec![0.0; locs.len()];
        for (i, &loc) in locs.iter().enumerate() {
            dist[i] = tree.distance_to_soma(loc)?;
        }
        order.sort_by(|&a, &b| dist[a].partial_cmp(&dist[b]).expect("finite distances"));

        let mut comp_tree = Tree::new(CompartmentNode::empty(roots[0]));
        let mut node_of: AHashMap<usize, usize> = AHashMap::new();
        node_of.insert(roots[0], comp_tree.root_index());
        for &i in &order {
            if i == roots[0] {
                continue;
            }
            let parent_loc = parent_of[i].expect("non-root location has a parent");
            let parent_node = node_of[&parent_loc];
            let node = comp_tree.insert(parent_node, CompartmentNode::empty(i))?;
            node_of.insert(i, node);
        }
        Ok(CompartmentTree { tree: comp_tree })
    }

    /// Total capacitance of the model (µF).
    pub fn total_capacitance(&self) -> f64 {
        self.tree.iter_pre_order().map(|n| n.payload.ca).sum()
    }

    /// System (conductance) matrix at complex frequency `s` (µS), indexed by
    /// `loc_idx`.
    pub fn system_matrix(
        &self,
        s: C64,
        registry: &ChannelRegistry,
        mode: ChannelMode,
    ) -> Result<DMatrix<C64>> {
        let n = self.tree.len();
        let mut matrix = DMatrix::<C64>::zeros(n, n);
        for node in self.tree.iter_pre_order() {
            let payload = &node.payload;
            let i = payload.loc_idx;
            let mut diag = C64::new(payload.ca, 0.0) * s;
            for (name, current) in &payload.currents {
                if name == LEAK {
                    diag += C64::new(current.g, 0.0);
                    continue;
                }
                let channel = registry
                    .require(name)
                    .map_err(|_| TreeError::UnknownChannel(name.clone()))?;
                diag += match mode {
                    ChannelMode::Frozen => {
                        C64::new(current.g * channel.frozen_conductance(payload.v_ep), 0.0)
                    }
                    ChannelMode::QuasiActive => {
                        current.g * channel.linearized_admittance(payload.v_ep, current.e, s)
                    }
                };
            }
            if node.parent().is_some() {
                diag += C64::new(payload.g_c, 0.0);
                let parent_idx = self
                    .tree
                    .payload(node.parent().expect("checked"))
                    ?
                    .loc_idx;
                matrix[(i, parent_idx)] -= C64::new(payload.g_c, 0.0);
                matrix[(parent_idx, i)] -= C64::new(payload.g_c, 0.0);
                matrix[(parent_idx, parent_idx)] += C64::new(payload.g_c, 0.0);
            }
            matrix[(i, i)] += diag;
        }
        Ok(matrix)
    }

    /// Impedance matrix `G(s)⁻¹` (MΩ), indexed by `loc_idx`.
    pub fn impedance_matrix(
        &self,
        s: C64,
        registry: &ChannelRegistry,
        mode: ChannelMode,
    ) -> Result<DMatrix<C64>> {
        let system = self.system_matrix(s, registry, mode)?;
        system
            .clone()
            .lu()
            .try_inverse()
            .ok_or_else(|| {
                FitError::Solver(SolverError::SingularSystem {
                    detail: "compartment system matrix is not invertible".into(),
                })
            })
    }

    /// Real steady-state impedance matrix (MΩ).
    pub fn steady_state_impedance(
        &self,
        registry: &ChannelRegistry,
        mode: ChannelMode,
    ) -> Result<DMatrix<f64>> {
        let z = self.impedance_matrix(C64::new(0.0, 0.0), registry, mode)?;
        Ok(z.map(|v| v.re))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabletree_structures::{phys_tree_from_records, MorphRecord};

    fn y_tree() -> cabletree_structures::PhysTree {
        let records = vec![
            MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 8.0, parent: -1 },
            MorphRecord { index: 2, kind: 3, x: 80.0, y: 0.0, z: 0.0, radius: 1.0, parent: 1 },
            MorphRecord { index: 3, kind: 3, x: 160.0, y: 40.0, z: 0.0, radius: 0.8, parent: 2 },
            MorphRecord { index: 4, kind: 3, x: 160.0, y: -40.0, z: 0.0, radius: 0.8, parent: 2 },
        ];
        let mut tree = phys_tree_from_records(&records).unwrap();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(100.0, -75.0).unwrap();
        tree
    }

    #[test]
    fn test_topology_from_locations() {
        let tree = y_tree();
        let locs = [
            Loc { node: 0, x: 1.0 },
            Loc::distal(2),
            Loc::distal(3),
            Loc::mid(1),
        ];
        let ctree = CompartmentTree::from_locations(&tree, &locs).unwrap();
        assert_eq!(ctree.n_compartments(), 4);
        // Soma location is the reduced root; the mid-branch location sits
        // between it and the two tips.
        let root_loc = ctree.tree().payload(ctree.tree().root_index()).unwrap().loc_idx;
        assert_eq!(root_loc, 0);
        for node in ctree.tree().iter_pre_order() {
            if let Some(parent) = node.parent() {
                let child_loc = node.payload.loc_idx;
                let parent_loc = ctree.tree().payload(parent).unwrap().loc_idx;
                if child_loc == 1 || child_loc == 2 {
                    assert_eq!(parent_loc, 3);
                }
            }
        }
    }

    #[test]
    fn test_two_roots_are_rejected() {
        let tree = y_tree();
        // Two sibling-branch tips with no shared proximal location.
        let locs = [Loc::distal(2), Loc::distal(3)];
        assert!(matches!(
            CompartmentTree::from_locations(&tree, &locs),
            Err(FitError::InvalidLocations(_))
        ));
    }

    #[test]
    fn test_impedance_matrix_of_two_compartments() {
        let registry = ChannelRegistry::new();
        let mut tree = Tree::new(CompartmentNode {
            loc_idx: 0,
            ca: 1e-5,
            g_c: 0.0,
            currents: [(LEAK.to_string(), CompartmentCurrent { g: 0.01, e: -75.0 })]
                .into_iter()
                .collect(),
            v_ep: -75.0,
        });
        tree.insert(
            0,
            CompartmentNode {
                loc_idx: 1,
                ca: 2e-5,
                g_c: 0.005,
                currents: [(LEAK.to_string(), CompartmentCurrent { g: 0.02, e: -75.0 })]
                    .into_iter()
                    .collect(),
                v_ep: -75.0,
            },
        )
        .unwrap();
        let ctree = CompartmentTree::from_tree(tree);
        let z = ctree
            .steady_state_impedance(&registry, ChannelMode::Frozen)
            .unwrap();
        // G = [[0.015, -0.005], [-0.005, 0.025]]; Z = G⁻¹.
        let det = 0.015 * 0.025 - 0.005 * 0.005;
        assert!((z[(0, 0)] - 0.025 / det).abs() < 1e-9);
        assert!((z[(0, 1)] - 0.005 / det).abs() < 1e-9);
        assert!((z[(1, 1)] - 0.015 / det).abs() < 1e-9);
        // Capacitance only enters at non-zero frequency.
        let z_ac = ctree
            .impedance_matrix(C64::new(0.0, 1000.0), &registry, ChannelMode::Frozen)
            .unwrap();
        assert!(z_ac[(0, 0)].norm() < z[(0, 0)]);
    }
}
