// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Frequency-domain impedance solver on the morphological tree.
//!
//! Each node's segment is a uniform cable with membrane impedance per area
//! `z_m(s) = 1/(c_m s + g_m(s))`, propagation constant
//! `γ = sqrt(2 r_a / (a z_m))` and characteristic impedance
//! `z_c = r_a / (π a² γ)`. A post-order sweep collects the distal boundary
//! admittance `g_down` of every node (sealed leaf ends, point shunts, the
//! soma sphere at the root); a pre-order sweep collects the proximal
//! admittance `g_up`. Input impedances combine the two piece admittances at
//! a location; transfer impedances multiply the input impedance with the
//! voltage attenuation of every traversed piece.
//!
//! Channels enter the membrane admittance either frozen at the operating
//! point or as quasi-active linearized admittances.

use ahash::AHashMap;
use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use cabletree_channels::ChannelRegistry;
use cabletree_structures::{Loc, MembranePayload, Tree, TreeError, LEAK};

use crate::error::{Result, SolverError};
use crate::kernel::C64;

/// How ion channels contribute to the membrane admittance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Channels contribute their steady-state conductance at the operating
    /// point; no frequency dependence.
    Frozen,
    /// Channels are linearized around the operating point into
    /// frequency-dependent admittances.
    QuasiActive,
}

/// Per-node cable coefficients at one frequency.
#[derive(Debug, Clone)]
struct NodeCoeffs {
    /// γ·L of the node's segment (dimensionless; zero for the root).
    gamma_l: C64,
    /// Characteristic impedance (MΩ; unused for the root).
    z_c: C64,
    /// Admittance at the node's distal point looking into the subtree (µS).
    g_down: C64,
    /// Admittance at the node's proximal point looking rootward (µS).
    g_up: C64,
}

/// All per-node coefficients for one frequency.
struct FreqData {
    coeffs: AHashMap<usize, NodeCoeffs>,
}

impl FreqData {
    fn get(&self, index: usize) -> &NodeCoeffs {
        &self.coeffs[&index]
    }
}

/// Input admittance of a cable piece with electrotonic length `γℓ`,
/// characteristic impedance `z_c` and far-end load admittance `g_load`.
fn piece_admittance(z_c: C64, gamma_l: C64, g_load: C64) -> C64 {
    let t = gamma_l.tanh();
    (z_c * g_load + t) / (z_c * (C64::new(1.0, 0.0) + z_c * g_load * t))
}

/// Voltage attenuation across a cable piece towards a far-end load.
fn piece_attenuation(z_c: C64, gamma_l: C64, g_fwd: C64) -> C64 {
    C64::new(1.0, 0.0) / (gamma_l.cosh() + z_c * g_fwd * gamma_l.sinh())
}

/// Frequency-domain Green's-function solver over a physiological tree.
pub struct GreensSolver<'a, T: MembranePayload> {
    tree: &'a Tree<T>,
    registry: &'a ChannelRegistry,
    mode: ChannelMode,
    voltage_override: Option<f64>,
}

impl<'a, T: MembranePayload> GreensSolver<'a, T> {
    /// Create a solver over the fine-grained tree.
    ///
    /// Fails with a geometry error when any non-root node has a non-positive
    /// radius or segment length, and rejects trees whose computational view
    /// is currently active (the solve is defined on the fine geometry).
    pub fn new(tree: &'a Tree<T>, registry: &'a ChannelRegistry) -> Result<Self> {
        if tree.view_active() {
            return Err(SolverError::InvalidInput(
                "deactivate the computational view before solving on the fine geometry".into(),
            ));
        }
        for node in tree.iter_pre_order() {
            let index = node.index();
            let radius = node.payload.geometry().radius;
            if radius <= 0.0 {
                return Err(TreeError::Geometry {
                    index,
                    detail: format!("non-positive radius {radius}"),
                }
                .into());
            }
            if !tree.is_root(index) && tree.segment_length(index)? <= 0.0 {
                return Err(TreeError::Geometry {
                    index,
                    detail: "non-positive segment length".into(),
                }
                .into());
            }
        }
        Ok(GreensSolver {
            tree,
            registry,
            mode: ChannelMode::Frozen,
            voltage_override: None,
        })
    }

    /// Select the channel contribution model (default: frozen).
    pub fn with_mode(mut self, mode: ChannelMode) -> Self {
        self.mode = mode;
        self
    }

    /// Evaluate channels at a uniform holding potential instead of each
    /// node's expansion potential.
    pub fn with_voltage(mut self, v: f64) -> Self {
        self.voltage_override = Some(v);
        self
    }

    /// Membrane admittance density of a node (µS/cm²) at frequency `s`.
    fn membrane_admittance_density(&self, index: usize, s: C64) -> Result<C64> {
        let membrane = self.tree.payload(index)?.membrane();
        let v = self.voltage_override.unwrap_or(membrane.v_ep);
        let mut y = C64::new(membrane.c_m, 0.0) * s;
        for (name, density) in &membrane.currents {
            if name == LEAK {
                y += C64::new(density.g, 0.0);
                continue;
            }
            let channel = self
                .registry
                .require(name)
                .map_err(|_| TreeError::UnknownChannel(name.clone()))?;
            y += match self.mode {
                ChannelMode::Frozen => {
                    C64::new(density.g * channel.frozen_conductance(v), 0.0)
                }
                ChannelMode::QuasiActive => {
                    density.g * channel.linearized_admittance(v, density.e, s)
                }
            };
        }
        Ok(y)
    }

    /// Compute the per-node cable coefficients and boundary admittances for
    /// one frequency.
    fn frequency_data(&self, s: C64) -> Result<FreqData> {
        let tree = self.tree;
        let mut coeffs: AHashMap<usize, NodeCoeffs> = AHashMap::new();

        // Cable coefficients per node.
        for node in tree.iter_pre_order() {
            let index = node.index();
            let geometry = node.payload.geometry();
            let (gamma_l, z_c) = if tree.is_root(index) {
                (C64::new(0.0, 0.0), C64::new(0.0, 0.0))
            } else {
                let y_m = self.membrane_admittance_density(index, s)?;
                let a = geometry.radius;
                let r_a = node.payload.membrane().r_a;
                let gamma = (C64::new(2.0 * r_a / a, 0.0) * y_m).sqrt();
                let z_c = C64::new(r_a / (std::f64::consts::PI * a * a), 0.0) / gamma;
                (gamma * tree.segment_length(index)?, z_c)
            };
            if !gamma_l.re.is_finite() || !gamma_l.im.is_finite() {
                return Err(SolverError::SingularSystem {
                    detail: format!("non-finite propagation constant at node {index}"),
                });
            }
            coeffs.insert(
                index,
                NodeCoeffs {
                    gamma_l,
                    z_c,
                    g_down: C64::new(0.0, 0.0),
                    g_up: C64::new(0.0, 0.0),
                },
            );
        }

        // Post-order: distal boundary admittances.
        let post: Vec<usize> = tree.iter_post_order().map(|n| n.index()).collect();
        for &index in &post {
            let node = tree.find(index)?;
            let mut g_down = C64::new(node.payload.membrane().g_shunt, 0.0);
            for &child in node.children() {
                let cc = &coeffs[&child];
                g_down += piece_admittance(cc.z_c, cc.gamma_l, cc.g_down);
            }
            if tree.is_root(index) {
                let soma_area = tree.membrane_area(index)?;
                g_down += self.membrane_admittance_density(index, s)? * soma_area;
            }
            coeffs.get_mut(&index).expect("coefficient present").g_down = g_down;
        }

        // Pre-order: proximal boundary admittances.
        let pre: Vec<usize> = tree.iter_pre_order().map(|n| n.index()).collect();
        for &index in &pre {
            let node = tree.find(index)?;
            let Some(parent) = node.parent() else { continue };
            let own = {
                let cc = &coeffs[&index];
                piece_admittance(cc.z_c, cc.gamma_l, cc.g_down)
            };
            let parent_coeffs = &coeffs[&parent];
            let mut g_up = parent_coeffs.g_down - own;
            if !tree.is_root(parent) {
                g_up += piece_admittance(
                    parent_coeffs.z_c,
                    parent_coeffs.gamma_l,
                    parent_coeffs.g_up,
                );
            }
            coeffs.get_mut(&index).expect("coefficient present").g_up = g_up;
        }

        Ok(FreqData { coeffs })
    }

    fn input_impedance_from(&self, data: &FreqData, loc: Loc) -> Result<C64> {
        let index = loc.node;
        let cc = data.get(index);
        if self.tree.is_root(index) {
            if cc.g_down.norm() < 1e-300 {
                return Err(SolverError::SingularSystem {
                    detail: "vanishing input admittance at the soma".into(),
                });
            }
            return Ok(C64::new(1.0, 0.0) / cc.g_down);
        }
        let y = piece_admittance(cc.z_c, cc.gamma_l * loc.x, cc.g_up)
            + piece_admittance(cc.z_c, cc.gamma_l * (1.0 - loc.x), cc.g_down);
        if y.norm() < 1e-300 {
            return Err(SolverError::SingularSystem {
                detail: format!("vanishing input admittance at node {index}"),
            });
        }
        Ok(C64::new(1.0, 0.0) / y)
    }

    /// Fine-view path from a node up to the root.
    fn fine_path_to_root(&self, index: usize) -> Result<Vec<usize>> {
        let mut path = vec![index];
        let mut current = index;
        while let Some(parent) = self.tree.find(current)?.parent() {
            path.push(parent);
            current = parent;
        }
        Ok(path)
    }

    fn transfer_impedance_from(&self, data: &FreqData, a: Loc, b: Loc) -> Result<C64> {
        if a.node == b.node {
            let cc = data.get(a.node);
            if (a.x - b.x).abs() < 1e-15 || self.tree.is_root(a.node) {
                return self.input_impedance_from(data, a);
            }
            let (x1, x2) = if a.x <= b.x { (a.x, b.x) } else { (b.x, a.x) };
            let source = Loc { node: a.node, x: x1 };
            let g_fwd =
                piece_admittance(cc.z_c, cc.gamma_l * (1.0 - x2), cc.g_down);
            let attenuation =
                piece_attenuation(cc.z_c, cc.gamma_l * (x2 - x1), g_fwd);
            return Ok(self.input_impedance_from(data, source)? * attenuation);
        }

        let path_a = self.fine_path_to_root(a.node)?;
        let path_b = self.fine_path_to_root(b.node)?;
        let set_a: ahash::AHashSet<usize> = path_a.iter().copied().collect();
        let lca = *path_b
            .iter()
            .find(|idx| set_a.contains(idx))
            .expect("tree is connected");

        // Reciprocity: orient the walk so it starts above (or at) the fork.
        if lca == b.node {
            return self.transfer_impedance_from(data, b, a);
        }

        let mut z = self.input_impedance_from(data, a)?;

        if lca == a.node {
            // Downward only: remaining distal part of a's segment first.
            if !self.tree.is_root(a.node) {
                let cc = data.get(a.node);
                z *= piece_attenuation(cc.z_c, cc.gamma_l * (1.0 - a.x), cc.g_down);
            }
        } else {
            // Upward from a to the fork.
            let cc = data.get(a.node);
            z *= piece_attenuation(cc.z_c, cc.gamma_l * a.x, cc.g_up);
            for &mid in path_a.iter().skip(1).take_while(|&&idx| idx != lca) {
                let mc = data.get(mid);
                z *= piece_attenuation(mc.z_c, mc.gamma_l, mc.g_up);
            }
        }

        // Downward from the fork to b: path_b lists b.node first.
        let down_start = path_b
            .iter()
            .position(|&idx| idx == lca)
            .expect("lca lies on the path");
        for &mid in path_b[..down_start].iter().skip(1).rev() {
            let mc = data.get(mid);
            z *= piece_attenuation(mc.z_c, mc.gamma_l, mc.g_down);
        }
        let cb = data.get(b.node);
        let g_fwd = piece_admittance(cb.z_c, cb.gamma_l * (1.0 - b.x), cb.g_down);
        z *= piece_attenuation(cb.z_c, cb.gamma_l * b.x, g_fwd);
        Ok(z)
    }

    /// Input impedance at a location (MΩ).
    pub fn input_impedance(&self, loc: Loc, s: C64) -> Result<C64> {
        self.tree.check_loc(loc)?;
        let data = self.frequency_data(s)?;
        self.input_impedance_from(&data, loc)
    }

    /// Input admittance at a location (µS). Used by the eigenmode search as
    /// the admittance matching condition.
    pub fn input_admittance(&self, loc: Loc, s: C64) -> Result<C64> {
        Ok(C64::new(1.0, 0.0) / self.input_impedance(loc, s)?)
    }

    /// Transfer impedance between two locations (MΩ).
    pub fn impedance(&self, a: Loc, b: Loc, s: C64) -> Result<C64> {
        self.tree.check_loc(a)?;
        self.tree.check_loc(b)?;
        let data = self.frequency_data(s)?;
        self.transfer_impedance_from(&data, a, b)
    }

    /// Impedance matrix over a location set, one matrix per frequency.
    ///
    /// Frequencies are independent and evaluated in parallel; results are
    /// ordered by the input frequency index.
    pub fn impedance_matrix(&self, locs: &[Loc], freqs: &[C64]) -> Result<Vec<DMatrix<C64>>>
    where
        T: Sync,
    {
        if locs.is_empty() || freqs.is_empty() {
            return Err(SolverError::InvalidInput(
                "impedance matrix needs at least one location and frequency".into(),
            ));
        }
        for &loc in locs {
            self.tree.check_loc(loc)?;
        }
        debug!(
            n_locs = locs.len(),
            n_freqs = freqs.len(),
            "computing impedance matrices"
        );
        freqs
            .par_iter()
            .map(|&s| {
                let data = self.frequency_data(s)?;
                let n = locs.len();
                let mut matrix = DMatrix::<C64>::zeros(n, n);
                for i in 0..n {
                    for j in i..n {
                        let z = self.transfer_impedance_from(&data, locs[i], locs[j])?;
                        matrix[(i, j)] = z;
                        matrix[(j, i)] = z;
                    }
                }
                Ok(matrix)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabletree_structures::{phys_tree_from_records, MorphRecord, PhysTree};

    /// Sealed cylinder: tiny soma + straight 100 µm cable of radius 1 µm,
    /// in four segments.
    fn cylinder_tree() -> PhysTree {
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
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(100.0, -75.0).unwrap();
        tree.set_v_ep(-75.0).unwrap();
        tree
    }

    /// Analytic input/transfer impedance of a sealed-sealed cylinder at its
    /// two ends (steady state): `z_c coth(γL)` and `z_c / sinh(γL)`.
    fn analytic_cylinder(g_l: f64, r_a: f64, radius_cm: f64, length_cm: f64) -> (f64, f64) {
        let z_m = 1.0 / g_l;
        let gamma = (2.0 * r_a / (radius_cm * z_m)).sqrt();
        let z_c = r_a / (std::f64::consts::PI * radius_cm * radius_cm * gamma);
        let gl = gamma * length_cm;
        (z_c / gl.tanh(), z_c / gl.sinh())
    }

    #[test]
    fn test_cylinder_matches_analytic_steady_state() {
        let tree = cylinder_tree();
        let registry = ChannelRegistry::new();
        let solver = GreensSolver::new(&tree, &registry).unwrap();
        let s0 = C64::new(0.0, 0.0);
        let near = Loc { node: 1, x: 0.0 };
        let far = Loc::distal(4);
        let z00 = solver.impedance(near, near, s0).unwrap();
        let z01 = solver.impedance(near, far, s0).unwrap();
        let (z00_ref, z01_ref) = analytic_cylinder(100.0, 100.0e-6, 1.0e-4, 100.0e-4);
        // The vanishing soma sphere leaves the near end effectively sealed.
        assert!((z00.re - z00_ref).abs() / z00_ref < 1e-3, "{} vs {z00_ref}", z00.re);
        assert!((z01.re - z01_ref).abs() / z01_ref < 1e-3, "{} vs {z01_ref}", z01.re);
        assert!(z00.im.abs() < 1e-9);
    }

    #[test]
    fn test_kernel_symmetry() {
        let records = vec![
            MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 10.0, parent: -1 },
            MorphRecord { index: 2, kind: 3, x: 80.0, y: 0.0, z: 0.0, radius: 1.5, parent: 1 },
            MorphRecord { index: 3, kind: 3, x: 160.0, y: 40.0, z: 0.0, radius: 1.0, parent: 2 },
            MorphRecord { index: 4, kind: 3, x: 160.0, y: -40.0, z: 0.0, radius: 0.8, parent: 2 },
            MorphRecord { index: 5, kind: 3, x: 240.0, y: -40.0, z: 0.0, radius: 0.6, parent: 4 },
        ];
        let mut tree = phys_tree_from_records(&records).unwrap();
        tree.set_physiology(1.0, 150.0e-6).unwrap();
        tree.set_leak(80.0, -70.0).unwrap();
        let registry = ChannelRegistry::new();
        let solver = GreensSolver::new(&tree, &registry).unwrap();
        let locs = [
            Loc { node: 0, x: 1.0 },
            Loc { node: 2, x: 0.3 },
            Loc { node: 3, x: 0.9 },
            Loc { node: 4, x: 0.5 },
        ];
        for s in [C64::new(0.0, 0.0), C64::new(0.0, 400.0), C64::new(120.0, 2100.0)] {
            for &a in &locs {
                for &b in &locs {
                    let z_ab = solver.impedance(a, b, s).unwrap();
                    let z_ba = solver.impedance(b, a, s).unwrap();
                    assert!(
                        (z_ab - z_ba).norm() < 1e-9 * z_ab.norm().max(1e-9),
                        "asymmetry at {a:?} {b:?} {s}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_matrix_agrees_with_pointwise_eval() {
        let tree = cylinder_tree();
        let registry = ChannelRegistry::new();
        let solver = GreensSolver::new(&tree, &registry).unwrap();
        let locs = [Loc { node: 1, x: 0.0 }, Loc::mid(2), Loc::distal(4)];
        let freqs = [C64::new(0.0, 0.0), C64::new(0.0, 1000.0)];
        let matrices = solver.impedance_matrix(&locs, &freqs).unwrap();
        assert_eq!(matrices.len(), 2);
        for (f, matrix) in freqs.iter().zip(&matrices) {
            for i in 0..locs.len() {
                for j in 0..locs.len() {
                    let z = solver.impedance(locs[i], locs[j], *f).unwrap();
                    assert!((matrix[(i, j)] - z).norm() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn test_input_impedance_decreases_with_frequency() {
        let tree = cylinder_tree();
        let registry = ChannelRegistry::new();
        let solver = GreensSolver::new(&tree, &registry).unwrap();
        let loc = Loc::distal(4);
        let z0 = solver.input_impedance(loc, C64::new(0.0, 0.0)).unwrap();
        let z_hf = solver.input_impedance(loc, C64::new(0.0, 5000.0)).unwrap();
        assert!(z_hf.norm() < z0.norm());
    }
}
