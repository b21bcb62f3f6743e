// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! End-to-end reduction of a passive cylinder to two compartments.
//!
//! A 100 µm × 1 µm cylinder with uniform leak 100 µS/cm² (1e-4 S/cm²),
//! capacitance 1 µF/cm² and axial resistivity 100 Ω·cm is reduced to two
//! compartments at its ends. The reduced model's zero-frequency impedance
//! matrix must match the analytic sealed-sealed two-point solution
//! (`z_c coth(γL)` on the diagonal, `z_c / sinh(γL)` off-diagonal) within
//! 1 %.

use std::f64::consts::PI;

use cabletree::prelude::*;

const G_LEAK: f64 = 100.0; // µS/cm²
const C_M: f64 = 1.0; // µF/cm²
const R_A: f64 = 100.0e-6; // MΩ·cm (100 Ω·cm)
const RADIUS_CM: f64 = 1.0e-4; // 1 µm
const LENGTH_CM: f64 = 100.0e-4; // 100 µm

/// Cylinder morphology: a vanishing soma sphere plus four 25 µm pieces.
fn cylinder() -> PhysTree {
    let mut records = vec![MorphRecord {
        index: 1,
        kind: 1,
        x: 0.0,
        y: 0.0,
        z: 0.0,
        radius: 1e-3,
        parent: -1,
    }];
    for i in 0..4 {
        records.push(MorphRecord {
            index: 2 + i,
            kind: 3,
            x: 25.0 * (i + 1) as f64,
            y: 0.0,
            z: 0.0,
            radius: 1.0,
            parent: 1 + i,
        });
    }
    let mut tree = phys_tree_from_records(&records).unwrap();
    tree.set_physiology(C_M, R_A).unwrap();
    tree.set_leak(G_LEAK, -75.0).unwrap();
    tree.set_v_ep(-75.0).unwrap();
    tree
}

/// Analytic two-point steady-state impedance matrix of the sealed-sealed
/// cylinder.
fn analytic_matrix() -> [[f64; 2]; 2] {
    let z_m = 1.0 / G_LEAK;
    let gamma = (2.0 * R_A / (RADIUS_CM * z_m)).sqrt();
    let z_c = R_A / (PI * RADIUS_CM * RADIUS_CM * gamma);
    let gl = gamma * LENGTH_CM;
    let z_in = z_c / gl.tanh();
    let z_tr = z_c / gl.sinh();
    [[z_in, z_tr], [z_tr, z_in]]
}

#[test]
fn test_two_compartment_reduction_matches_analytic_cylinder() {
    let tree = cylinder();
    let registry = ChannelRegistry::new();
    let fitter = CompartmentFitter::new(&tree, &registry);
    let locs = [Loc { node: 1, x: 0.0 }, Loc { node: 4, x: 1.0 }];
    let ctree = fitter.fit_model(&locs).unwrap();
    assert_eq!(ctree.n_compartments(), 2);

    // Both leaks and the coupling conductance come out physical.
    let mut leaks = Vec::new();
    let mut couplings = Vec::new();
    for node in ctree.tree().iter_pre_order() {
        leaks.push(node.payload.currents["leak"].g);
        if node.parent().is_some() {
            couplings.push(node.payload.g_c);
        }
    }
    assert_eq!(leaks.len(), 2);
    assert_eq!(couplings.len(), 1);
    assert!(leaks.iter().all(|&g| g > 0.0));
    assert!(couplings[0] > 0.0);

    // The reduced model's steady-state matrix matches the analytic cable.
    let z_fit = ctree
        .steady_state_impedance(&registry, ChannelMode::Frozen)
        .unwrap();
    let z_ref = analytic_matrix();
    for i in 0..2 {
        for j in 0..2 {
            let relative = (z_fit[(i, j)] - z_ref[i][j]).abs() / z_ref[i][j];
            assert!(
                relative < 1e-2,
                "({i},{j}): fitted {} MΩ vs analytic {} MΩ (rel {relative:.2e})",
                z_fit[(i, j)],
                z_ref[i][j]
            );
        }
    }
}

#[test]
fn test_reduced_model_is_independent_of_source_tree() {
    let tree = cylinder();
    let registry = ChannelRegistry::new();
    let locs = [Loc { node: 1, x: 0.0 }, Loc { node: 4, x: 1.0 }];
    let ctree = CompartmentFitter::new(&tree, &registry)
        .fit_model(&locs)
        .unwrap();
    let z_before = ctree
        .steady_state_impedance(&registry, ChannelMode::Frozen)
        .unwrap();
    // Mutating (or dropping) the source tree leaves the reduced model
    // untouched.
    drop(tree);
    let z_after = ctree
        .steady_state_impedance(&registry, ChannelMode::Frozen)
        .unwrap();
    assert_eq!(z_before, z_after);
}
