// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Second-order finite-difference reduction of a physiological tree.
//!
//! Segments are split into pieces of at most `dx_max`; each grid point
//! becomes a compartment receiving half of every adjacent piece's membrane,
//! and adjacent points couple through the piece's axial conductance
//! `π a² / (r_a ℓ)`. Total capacitance, total membrane conductance and the
//! axial resistance per unit length are conserved exactly.

use tracing::debug;

use cabletree_structures::{Loc, MembranePayload, Tree, TreeError};

use crate::comptree::{CompartmentCurrent, CompartmentNode, CompartmentTree};
use crate::error::{FitError, Result};

/// Build a finite-difference compartment tree with grid spacing at most
/// `dx_max` (cm). Returns the tree and the location of every compartment,
/// index-aligned with the compartments' `loc_idx`.
pub fn finite_difference_tree<T: MembranePayload>(
    tree: &Tree<T>,
    dx_max: f64,
) -> Result<(CompartmentTree, Vec<Loc>)> {
    if dx_max <= 0.0 {
        return Err(FitError::InvalidLocations(format!(
            "grid spacing must be positive, got {dx_max}"
        )));
    }

    // Root compartment: the lumped soma sphere.
    let root_idx = tree.root_index();
    let soma_area = tree.membrane_area(root_idx)?;
    let root_membrane = tree.payload(root_idx)?.membrane();
    let mut root_comp = CompartmentNode::empty(0);
    root_comp.ca = root_membrane.c_m * soma_area;
    root_comp.v_ep = root_membrane.v_ep;
    for (name, density) in &root_membrane.currents {
        root_comp.currents.insert(
            name.clone(),
            CompartmentCurrent {
                g: density.g * soma_area,
                e: density.e,
            },
        );
    }
    add_shunt(&mut root_comp, root_membrane.g_shunt);

    let mut comp_tree = Tree::new(root_comp);
    let mut locs = vec![Loc {
        node: root_idx,
        x: 1.0,
    }];

    // Compartment index at each fine node's distal point.
    let mut distal_comp = ahash::AHashMap::new();
    distal_comp.insert(root_idx, comp_tree.root_index());

    for node in tree.iter_pre_order() {
        let index = node.index();
        if index == root_idx {
            continue;
        }
        let length = tree.segment_length(index)?;
        let geometry = tree.payload(index)?.geometry();
        let membrane = tree.payload(index)?.membrane().clone();
        if length <= 0.0 || geometry.radius <= 0.0 {
            return Err(TreeError::Geometry {
                index,
                detail: format!(
                    "cannot discretize segment with length {length} and radius {}",
                    geometry.radius
                ),
            }
            .into());
        }
        let parent = node.parent().expect("non-root node");
        let n_pieces = (length / dx_max).ceil().max(1.0) as usize;
        let dx = length / n_pieces as f64;
        let area_half = std::f64::consts::PI * geometry.radius * dx;
        let g_axial = std::f64::consts::PI * geometry.radius.powi(2) / (membrane.r_a * dx);

        let mut prev = distal_comp[&parent];
        for piece in 1..=n_pieces {
            let x = piece as f64 / n_pieces as f64;
            let mut comp = CompartmentNode::empty(locs.len());
            comp.ca = membrane.c_m * area_half;
            comp.g_c = g_axial;
            comp.v_ep = membrane.v_ep;
            for (name, density) in &membrane.currents {
                comp.currents.insert(
                    name.clone(),
                    CompartmentCurrent {
                        g: density.g * area_half,
                        e: density.e,
                    },
                );
            }
            if piece == n_pieces {
                add_shunt(&mut comp, membrane.g_shunt);
            }
            // The proximal half of this piece lumps into the previous point.
            {
                let prev_node = comp_tree.payload_mut(prev)?;
                prev_node.ca += membrane.c_m * area_half;
                for (name, density) in &membrane.currents {
                    let entry = prev_node
                        .currents
                        .entry(name.clone())
                        .or_insert(CompartmentCurrent { g: 0.0, e: density.e });
                    entry.g += density.g * area_half;
                }
            }
            let comp_idx = comp_tree.insert(prev, comp)?;
            locs.push(Loc { node: index, x });
            prev = comp_idx;
        }
        distal_comp.insert(index, prev);
    }

    debug!(
        n_compartments = locs.len(),
        dx_max, "built finite-difference tree"
    );
    Ok((CompartmentTree::from_tree(comp_tree), locs))
}

fn add_shunt(comp: &mut CompartmentNode, g_shunt: f64) {
    if g_shunt != 0.0 {
        let entry = comp
            .currents
            .entry("shunt".to_string())
            .or_insert(CompartmentCurrent { g: 0.0, e: 0.0 });
        entry.g += g_shunt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabletree_structures::{phys_tree_from_records, MorphRecord, LEAK, UM};

    fn chain(len_um: f64, pieces: usize) -> cabletree_structures::PhysTree {
        let mut records = vec![MorphRecord {
            index: 1,
            kind: 1,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            radius: 5.0,
            parent: -1,
        }];
        for i in 0..pieces {
            records.push(MorphRecord {
                index: 2 + i as i64,
                kind: 3,
                x: len_um * (i + 1) as f64 / pieces as f64,
                y: 0.0,
                z: 0.0,
                radius: 1.0,
                parent: 1 + i as i64,
            });
        }
        let mut tree = phys_tree_from_records(&records).unwrap();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(120.0, -75.0).unwrap();
        tree
    }

    #[test]
    fn test_grid_spacing_is_respected() {
        let tree = chain(200.0, 2);
        let (ctree, locs) = finite_difference_tree(&tree, 30.0 * UM).unwrap();
        assert_eq!(ctree.n_compartments(), locs.len());
        // 100 µm segments at dx ≤ 30 µm → 4 pieces each.
        assert_eq!(locs.len(), 1 + 2 * 4);
        for node in ctree.tree().iter_pre_order() {
            if let Some(parent) = node.parent() {
                let a = locs[node.payload.loc_idx];
                let b = locs[ctree.tree().payload(parent).unwrap().loc_idx];
                let d = tree.path_length(a, b).unwrap();
                assert!(d <= 30.0 * UM + 1e-12);
            }
        }
    }

    #[test]
    fn test_conservation_of_totals() {
        let tree = chain(150.0, 3);
        let (ctree, _) = finite_difference_tree(&tree, 12.0 * UM).unwrap();
        // Total capacitance matches the tree's membrane area times c_m.
        let mut ca_expected = 0.0;
        let mut g_expected = 0.0;
        for node in tree.iter_pre_order() {
            let area = tree.membrane_area(node.index()).unwrap();
            ca_expected += node.payload.membrane.c_m * area;
            g_expected += node.payload.membrane.currents[LEAK].g * area;
        }
        let ca_total = ctree.total_capacitance();
        assert!((ca_total - ca_expected).abs() < 1e-12 * ca_expected.max(1e-30));
        let g_total: f64 = ctree
            .tree()
            .iter_pre_order()
            .map(|n| n.payload.currents[LEAK].g)
            .sum();
        assert!((g_total - g_expected).abs() < 1e-12 * g_expected.max(1e-30));
        // Axial resistance per unit length is unchanged: each 50 µm segment
        // splits into 5 pieces whose series resistances sum back exactly.
        let r_segment = 100.0e-6 * 50.0 * UM / (std::f64::consts::PI * (1.0 * UM).powi(2));
        for node in ctree.tree().iter_pre_order() {
            if node.parent().is_some() {
                let r_piece = 1.0 / node.payload.g_c;
                assert!((r_piece - r_segment / 5.0).abs() < 1e-9 * r_piece);
            }
        }
    }

    #[test]
    fn test_bad_spacing_is_rejected() {
        let tree = chain(100.0, 1);
        assert!(finite_difference_tree(&tree, 0.0).is_err());
    }
}
