// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Separation-of-variables eigenmode solver.
//!
//! The passive (or frozen-channel) cable equation on the tree separates into
//! spatial eigenmodes with exponential temporal decay. Eigenvalues are the
//! poles of the input impedance on the negative real frequency axis: the
//! admittance matching condition at a probe location changes sign there, and
//! each bracket is refined by bisection. Candidates where the impedance
//! stays small are zeros (not poles) and are rejected; probing additional
//! leaf locations catches modes with a voltage node at the soma.
//!
//! Per eigenvalue the spatial mode is reconstructed segment-wise on the
//! basis `u1 = cosh(γχ)`, `u2 = sinh(γχ)/γ` (entire in γ², so the same code
//! covers both sides of the oscillatory threshold). The junction conditions
//! (voltage continuity, current conservation, sealed leaf ends, soma
//! balance) form a homogeneous linear system whose nullspace — the smallest
//! singular vector — yields the mode coefficients. Residues follow from the
//! capacitance-weighted mode norm, with closed-form segment integrals.

use ahash::AHashMap;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cabletree_channels::ChannelRegistry;
use cabletree_structures::{Loc, MembranePayload, Tree};

use crate::config::SovConfig;
use crate::error::{Result, SolverError};
use crate::greens::{ChannelMode, GreensSolver};
use crate::kernel::{C64, ExpKernel};

/// `u1(γ², χ) = cosh(γχ)`, real-valued for either sign of γ².
fn u1(e: f64, x: f64) -> f64 {
    if e > 1e-12 {
        (e.sqrt() * x).cosh()
    } else if e < -1e-12 {
        ((-e).sqrt() * x).cos()
    } else {
        1.0 + e * x * x / 2.0
    }
}

/// `u2(γ², χ) = sinh(γχ)/γ`, real-valued for either sign of γ².
fn u2(e: f64, x: f64) -> f64 {
    if e > 1e-12 {
        let g = e.sqrt();
        (g * x).sinh() / g
    } else if e < -1e-12 {
        let k = (-e).sqrt();
        (k * x).sin() / k
    } else {
        x * (1.0 + e * x * x / 6.0)
    }
}

/// Closed-form integrals of the basis products over `[0, length]`.
fn basis_integrals(e: f64, length: f64) -> (f64, f64, f64) {
    let c = u1(e, length);
    let s = u2(e, length);
    let i11 = length / 2.0 + c * s / 2.0;
    let i12 = s * s / 2.0;
    let i22 = if e.abs() < 1e-8 {
        length.powi(3) / 3.0
    } else {
        (c * s / 2.0 - length / 2.0) / e
    };
    (i11, i12, i22)
}

/// One spatial eigenmode with its decay rate.
#[derive(Debug, Clone)]
pub struct Eigenmode {
    /// Temporal decay rate (rad/s).
    pub alpha: f64,
    /// Capacitance-weighted squared norm of the mode (µF).
    norm: f64,
    /// Mode value at the soma.
    v_soma: f64,
    /// Per-segment coefficients `(A, B)`.
    coeffs: AHashMap<usize, (f64, f64)>,
    /// Per-segment `γ²` (1/cm²).
    gamma2: AHashMap<usize, f64>,
}

impl Eigenmode {
    /// Evaluate the spatial mode at a location.
    pub fn eval<T: MembranePayload>(&self, tree: &Tree<T>, loc: Loc) -> Result<f64> {
        tree.check_loc(loc)?;
        if tree.is_root(loc.node) {
            return Ok(self.v_soma);
        }
        let (a, b) = self.coeffs[&loc.node];
        let e = self.gamma2[&loc.node];
        let chi = loc.x * tree.segment_length(loc.node)?;
        Ok(a * u1(e, chi) + b * u2(e, chi))
    }

    /// Residue of the Green's function between two mode values (MΩ/s).
    pub fn residue(&self, phi_x: f64, phi_y: f64) -> f64 {
        phi_x * phi_y / self.norm
    }
}

/// Eigenmode expansion of the impedance kernels over a fixed location set.
///
/// All location pairs share the pole basis; residues are one matrix per
/// mode. Rates in 1/ms, residues in MΩ/ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeExpansion {
    /// Decay rates (1/ms).
    pub alphas: Vec<f64>,
    /// Residue matrix per mode (MΩ/ms).
    pub residues: Vec<DMatrix<f64>>,
}

impl ModeExpansion {
    /// Number of locations of the expansion.
    pub fn n_locs(&self) -> usize {
        self.residues.first().map_or(0, |m| m.nrows())
    }

    /// Kernel between two location indices.
    pub fn kernel(&self, i: usize, j: usize) -> Result<ExpKernel> {
        let a: Vec<f64> = self.alphas.clone();
        let c: Vec<f64> = self.residues.iter().map(|m| m[(i, j)]).collect();
        ExpKernel::from_real(&a, &c)
    }

    /// Quasi-static impedance matrix `Σ_n residues_n / α_n` (MΩ).
    pub fn steady_state_matrix(&self) -> DMatrix<f64> {
        let n = self.n_locs();
        let mut total = DMatrix::<f64>::zeros(n, n);
        for (alpha, residue) in self.alphas.iter().zip(&self.residues) {
            total += residue / *alpha;
        }
        total
    }
}

/// Separation-of-variables solver over a physiological tree.
///
/// Channels are frozen at the operating point: the eigenvalue problem
/// requires a frequency-independent membrane conductance.
pub struct SovSolver<'a, T: MembranePayload> {
    tree: &'a Tree<T>,
    registry: &'a ChannelRegistry,
    config: SovConfig,
}

impl<'a, T: MembranePayload + Sync> SovSolver<'a, T> {
    /// Create a solver; geometry is validated as for the Green's solver.
    pub fn new(
        tree: &'a Tree<T>,
        registry: &'a ChannelRegistry,
        config: SovConfig,
    ) -> Result<Self> {
        GreensSolver::new(tree, registry)?;
        Ok(SovSolver {
            tree,
            registry,
            config,
        })
    }

    /// Frozen membrane conductance density of a node (µS/cm²).
    fn conductance_density(&self, index: usize) -> Result<f64> {
        let v = self.tree.payload(index)?.membrane().v_ep;
        Ok(self
            .tree
            .total_conductance_density(index, v, self.registry)?)
    }

    /// Locate the eigenvalues by scanning the admittance matching condition.
    fn find_poles(&self) -> Result<Vec<f64>> {
        let solver = GreensSolver::new(self.tree, self.registry)?.with_mode(ChannelMode::Frozen);
        let mut probes = vec![Loc {
            node: self.tree.root_index(),
            x: 1.0,
        }];
        if self.config.probe_leaves {
            probes.extend(self.tree.leaves().into_iter().filter_map(|idx| {
                if self.tree.is_root(idx) {
                    None
                } else {
                    Some(Loc::distal(idx))
                }
            }));
        }

        let admittance = |probe: Loc, alpha: f64| -> Result<f64> {
            Ok(solver
                .input_admittance(probe, C64::new(-alpha, 0.0))?
                .re)
        };

        let mut poles: Vec<f64> = Vec::new();
        let u_min = self.config.alpha_min.sqrt();
        let u_max = self.config.alpha_max.sqrt();
        let n = self.config.scan_points.max(2);
        for &probe in &probes {
            let z_ref = solver
                .input_impedance(probe, C64::new(0.0, 0.0))?
                .norm();
            let mut prev: Option<(f64, f64)> = None;
            for k in 0..n {
                let u = u_min + (u_max - u_min) * k as f64 / (n - 1) as f64;
                let alpha = u * u;
                let f = match admittance(probe, alpha) {
                    Ok(f) if f.is_finite() => f,
                    _ => {
                        prev = None;
                        continue;
                    }
                };
                if let Some((alpha_prev, f_prev)) = prev {
                    if f_prev * f < 0.0 {
                        if let Some(root) =
                            self.bisect(&|a| admittance(probe, a), alpha_prev, alpha, f_prev)?
                        {
                            let z_at = solver
                                .input_impedance(probe, C64::new(-root, 0.0))?
                                .norm();
                            // A pole of the impedance, not a zero.
                            if z_at > z_ref {
                                poles.push(root);
                            }
                        }
                    }
                }
                prev = Some((alpha, f));
            }
        }

        poles.sort_by(|a, b| a.partial_cmp(b).expect("finite poles"));
        poles.dedup_by(|a, b| (*a - *b).abs() < 1e-8 * b.abs().max(1.0));
        if poles.len() > self.config.max_modes {
            warn!(
                found = poles.len(),
                kept = self.config.max_modes,
                "eigenvalue scan found more modes than the configured cap"
            );
            poles.truncate(self.config.max_modes);
        }
        if poles.is_empty() {
            return Err(SolverError::Convergence {
                context: "eigenvalue scan",
                iterations: n,
                residual: f64::INFINITY,
                tolerance: self.config.bisection_tolerance,
            });
        }
        Ok(poles)
    }

    /// Bisection refinement of a sign-change bracket.
    fn bisect(
        &self,
        f: &dyn Fn(f64) -> Result<f64>,
        mut lo: f64,
        mut hi: f64,
        f_lo: f64,
    ) -> Result<Option<f64>> {
        let sign_lo = f_lo.signum();
        for _ in 0..self.config.max_bisection_iterations {
            let mid = 0.5 * (lo + hi);
            if (hi - lo) < self.config.bisection_tolerance * mid.abs().max(1.0) {
                return Ok(Some(mid));
            }
            let f_mid = f(mid)?;
            if !f_mid.is_finite() {
                return Ok(None);
            }
            if f_mid.signum() == sign_lo {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Err(SolverError::Convergence {
            context: "eigenvalue bisection",
            iterations: self.config.max_bisection_iterations,
            residual: hi - lo,
            tolerance: self.config.bisection_tolerance,
        })
    }

    /// Assemble and solve the junction system for one eigenvalue.
    fn mode_for_pole(&self, alpha: f64) -> Result<Option<Eigenmode>> {
        let tree = self.tree;
        let non_root: Vec<usize> = tree
            .iter_pre_order()
            .map(|n| n.index())
            .filter(|&idx| !tree.is_root(idx))
            .collect();
        let n_seg = non_root.len();
        let dim = 2 * n_seg + 1;
        // Unknown layout: [v_soma, A_0, B_0, A_1, B_1, ...]
        let col_a: AHashMap<usize, usize> = non_root
            .iter()
            .enumerate()
            .map(|(k, &idx)| (idx, 1 + 2 * k))
            .collect();

        let mut gamma2: AHashMap<usize, f64> = AHashMap::new();
        let mut lengths: AHashMap<usize, f64> = AHashMap::new();
        let mut f_axial: AHashMap<usize, f64> = AHashMap::new();
        for &idx in &non_root {
            let g = self.conductance_density(idx)?;
            let membrane = tree.payload(idx)?.membrane();
            let geometry = tree.payload(idx)?.geometry();
            let e = 2.0 * membrane.r_a * (g - membrane.c_m * alpha) / geometry.radius;
            gamma2.insert(idx, e);
            lengths.insert(idx, tree.segment_length(idx)?);
            f_axial.insert(
                idx,
                std::f64::consts::PI * geometry.radius.powi(2) / membrane.r_a,
            );
        }

        let mut matrix = DMatrix::<f64>::zeros(dim, dim);
        let mut row = 0;

        // Voltage continuity at each segment's proximal end.
        for &idx in &non_root {
            let parent = tree.find(idx)?.parent().expect("non-root node");
            matrix[(row, col_a[&idx])] = 1.0;
            if tree.is_root(parent) {
                matrix[(row, 0)] = -1.0;
            } else {
                let e = gamma2[&parent];
                let length = lengths[&parent];
                matrix[(row, col_a[&parent])] = -u1(e, length);
                matrix[(row, col_a[&parent] + 1)] = -u2(e, length);
            }
            row += 1;
        }

        // Current balance at every node's distal point.
        for node in tree.iter_pre_order() {
            let idx = node.index();
            if tree.is_root(idx) {
                // Soma: axial inflow balances the soma membrane current.
                let root_membrane = tree.payload(idx)?.membrane();
                let g_soma = (self.conductance_density(idx)?
                    - root_membrane.c_m * alpha)
                    * tree.membrane_area(idx)?
                    + root_membrane.g_shunt;
                matrix[(row, 0)] = g_soma;
                for &child in node.children() {
                    matrix[(row, col_a[&child] + 1)] = -f_axial[&child];
                }
            } else if node.children().is_empty() {
                // Sealed end: V'(L) = 0.
                let e = gamma2[&idx];
                let length = lengths[&idx];
                matrix[(row, col_a[&idx])] = e * u2(e, length);
                matrix[(row, col_a[&idx] + 1)] = u1(e, length);
            } else {
                let e = gamma2[&idx];
                let length = lengths[&idx];
                let f_i = f_axial[&idx];
                let g_shunt = tree.payload(idx)?.membrane().g_shunt;
                let (c, s) = (u1(e, length), u2(e, length));
                matrix[(row, col_a[&idx])] = -f_i * e * s - g_shunt * c;
                matrix[(row, col_a[&idx] + 1)] = -f_i * c - g_shunt * s;
                for &child in node.children() {
                    matrix[(row, col_a[&child] + 1)] = f_axial[&child];
                }
            }
            row += 1;
        }
        debug_assert_eq!(row, dim);

        // Normalize rows: continuity and current rows have different scales.
        for r in 0..dim {
            let norm = matrix.row(r).norm();
            if norm > 0.0 {
                for c in 0..dim {
                    matrix[(r, c)] /= norm;
                }
            }
        }

        let svd = matrix.svd(true, true);
        let sigma = &svd.singular_values;
        let (mut min_idx, mut min_val) = (0, f64::INFINITY);
        let mut max_val = 0.0f64;
        for (i, &s) in sigma.iter().enumerate() {
            if s < min_val {
                min_val = s;
                min_idx = i;
            }
            max_val = max_val.max(s);
        }
        if max_val <= 0.0 || min_val / max_val > self.config.nullspace_tolerance {
            debug!(
                alpha,
                ratio = min_val / max_val,
                "discarding candidate eigenvalue without a clear nullspace"
            );
            return Ok(None);
        }
        let v_t = svd.v_t.as_ref().ok_or_else(|| SolverError::SingularSystem {
            detail: "SVD did not return right singular vectors".into(),
        })?;
        let mode_vec: DVector<f64> = v_t.row(min_idx).transpose();

        let v_soma = mode_vec[0];
        let mut coeffs = AHashMap::new();
        for &idx in &non_root {
            coeffs.insert(idx, (mode_vec[col_a[&idx]], mode_vec[col_a[&idx] + 1]));
        }

        // Capacitance-weighted norm.
        let root_idx = tree.root_index();
        let mut norm = tree.payload(root_idx)?.membrane().c_m
            * tree.membrane_area(root_idx)?
            * v_soma
            * v_soma;
        for &idx in &non_root {
            let (a, b) = coeffs[&idx];
            let e = gamma2[&idx];
            let length = lengths[&idx];
            let (i11, i12, i22) = basis_integrals(e, length);
            let c_m = tree.payload(idx)?.membrane().c_m;
            let circumference =
                2.0 * std::f64::consts::PI * tree.payload(idx)?.geometry().radius;
            norm += c_m * circumference * (a * a * i11 + 2.0 * a * b * i12 + b * b * i22);
        }
        if norm <= 0.0 || !norm.is_finite() {
            return Ok(None);
        }

        Ok(Some(Eigenmode {
            alpha,
            norm,
            v_soma,
            coeffs,
            gamma2,
        }))
    }

    /// All eigenmodes up to the configured spectral bound.
    pub fn eigenmodes(&self) -> Result<Vec<Eigenmode>> {
        let poles = self.find_poles()?;
        debug!(n_poles = poles.len(), "refining eigenmodes");
        let mut modes = Vec::with_capacity(poles.len());
        for alpha in poles {
            if let Some(mode) = self.mode_for_pole(alpha)? {
                modes.push(mode);
            }
        }
        if modes.is_empty() {
            return Err(SolverError::SingularSystem {
                detail: "no eigenmode survived the nullspace check".into(),
            });
        }
        Ok(modes)
    }

    /// Mode expansion of the kernels over a location set.
    pub fn expansion(&self, locs: &[Loc]) -> Result<ModeExpansion> {
        if locs.is_empty() {
            return Err(SolverError::InvalidInput(
                "mode expansion needs at least one location".into(),
            ));
        }
        let modes = self.eigenmodes()?;
        let n = locs.len();
        let mut alphas = Vec::with_capacity(modes.len());
        let mut residues = Vec::with_capacity(modes.len());
        for mode in &modes {
            let phi: Vec<f64> = locs
                .iter()
                .map(|&loc| mode.eval(self.tree, loc))
                .collect::<Result<_>>()?;
            let mut residue = DMatrix::<f64>::zeros(n, n);
            for i in 0..n {
                for j in i..n {
                    let r = mode.residue(phi[i], phi[j]) * 1e-3;
                    residue[(i, j)] = r;
                    residue[(j, i)] = r;
                }
            }
            alphas.push(mode.alpha * 1e-3);
            residues.push(residue);
        }
        Ok(ModeExpansion { alphas, residues })
    }

    /// Impulse-response kernel between two locations as a sum of
    /// exponentials.
    pub fn kernel(&self, a: Loc, b: Loc) -> Result<ExpKernel> {
        let expansion = self.expansion(&[a, b])?;
        expansion.kernel(0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabletree_structures::{phys_tree_from_records, MorphRecord, PhysTree};

    /// Tiny soma + 100 µm cable of radius 1 µm, uniform passive membrane.
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
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(100.0, -75.0).unwrap();
        tree
    }

    #[test]
    fn test_cylinder_eigenvalues_match_analytic() {
        let tree = cylinder();
        let registry = ChannelRegistry::new();
        let solver = SovSolver::new(&tree, &registry, SovConfig::default()).unwrap();
        let modes = solver.eigenmodes().unwrap();
        assert!(modes.len() >= 3, "found {} modes", modes.len());
        // Sealed-sealed uniform cable: α_n = (g + (nπ/L)² a/(2 r_a)) / c_m.
        let g = 100.0;
        let a_cm = 1.0e-4;
        let r_a = 100.0e-6;
        let length = 100.0e-4;
        for (n, mode) in modes.iter().take(3).enumerate() {
            let kappa = n as f64 * std::f64::consts::PI / length;
            let expected = g + kappa * kappa * a_cm / (2.0 * r_a);
            assert!(
                (mode.alpha - expected).abs() / expected < 5e-3,
                "mode {n}: {} vs {expected}",
                mode.alpha
            );
        }
    }

    #[test]
    fn test_quasi_static_sum_matches_greens() {
        let tree = cylinder();
        let registry = ChannelRegistry::new();
        let solver = SovSolver::new(&tree, &registry, SovConfig::default()).unwrap();
        let locs = [Loc { node: 1, x: 0.0 }, Loc::distal(4)];
        let expansion = solver.expansion(&locs).unwrap();
        let z_sov = expansion.steady_state_matrix();

        let greens = GreensSolver::new(&tree, &registry).unwrap();
        let z_ref = greens
            .impedance_matrix(&locs, &[C64::new(0.0, 0.0)])
            .unwrap()
            .remove(0);
        for i in 0..2 {
            for j in 0..2 {
                let reference = z_ref[(i, j)].re;
                assert!(
                    (z_sov[(i, j)] - reference).abs() / reference < 1e-2,
                    "({i},{j}): {} vs {reference}",
                    z_sov[(i, j)]
                );
            }
        }
    }

    #[test]
    fn test_kernel_surface_equals_steady_state() {
        let tree = cylinder();
        let registry = ChannelRegistry::new();
        let solver = SovSolver::new(&tree, &registry, SovConfig::default()).unwrap();
        let locs = [Loc { node: 1, x: 0.0 }, Loc::distal(4)];
        let expansion = solver.expansion(&locs).unwrap();
        let kernel = expansion.kernel(0, 1).unwrap();
        let z = expansion.steady_state_matrix();
        assert!((kernel.k_bar() - z[(0, 1)]).abs() < 1e-9);
        // Causality of the mode expansion.
        assert_eq!(kernel.eval(-0.5), 0.0);
    }

    #[test]
    fn test_branched_tree_modes_are_positive_and_ordered() {
        let records = vec![
            MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 6.0, parent: -1 },
            MorphRecord { index: 2, kind: 3, x: 70.0, y: 0.0, z: 0.0, radius: 1.2, parent: 1 },
            MorphRecord { index: 3, kind: 3, x: 140.0, y: 50.0, z: 0.0, radius: 0.8, parent: 2 },
            MorphRecord { index: 4, kind: 3, x: 140.0, y: -50.0, z: 0.0, radius: 0.8, parent: 2 },
        ];
        let mut tree = phys_tree_from_records(&records).unwrap();
        tree.set_physiology(1.0, 120.0e-6).unwrap();
        tree.set_leak(90.0, -70.0).unwrap();
        let registry = ChannelRegistry::new();
        let solver = SovSolver::new(&tree, &registry, SovConfig::default()).unwrap();
        let modes = solver.eigenmodes().unwrap();
        assert!(!modes.is_empty());
        let mut prev = 0.0;
        for mode in &modes {
            assert!(mode.alpha > prev);
            prev = mode.alpha;
        }
    }
}
