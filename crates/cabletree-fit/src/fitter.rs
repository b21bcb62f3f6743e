// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Compartment-reduction fitter.
//!
//! Given a location set on the full tree, the fitter builds a reduced
//! [`CompartmentTree`] whose impedance matrix — computed by the same solver
//! machinery on the small model — reproduces the full tree's matrix at
//! those locations:
//!
//! 1. leak and coupling conductances from the steady-state matching
//!    `G·Z = I`, which is linear in the conductances (non-negative least
//!    squares keeps every parameter physical); with channels present the
//!    system is fitted jointly across several holding potentials, which
//!    separates the channel densities from the leak;
//! 2. reversal potentials from the equilibrium condition at the full
//!    tree's operating point;
//! 3. capacitances from the residual of `G(s)·Z(s) = I` at a set of
//!    non-zero frequencies;
//! 4. verification of the reduced model against the target matrix, failing
//!    with the achieved residual when the topology cannot represent the
//!    kernels.
//!
//! Expensive full-tree targets are memoized through the digest-keyed
//! kernel cache.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cabletree_channels::ChannelRegistry;
use cabletree_solver::{
    tree_digest, C64, CacheValue, ChannelMode, EquilibriumConfig, EquilibriumSolver, GreensSolver,
    KernelCache,
};
use cabletree_structures::{Loc, MembranePayload, Tree};

use crate::comptree::{CompartmentCurrent, CompartmentTree, LEAK};
use crate::error::{FitError, Result};
use crate::nnls::nnls;

/// Configuration of the reduction fitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Relative Frobenius tolerance of the final verification.
    pub fit_tolerance: f64,
    /// Angular frequencies (rad/s) used for the capacitance fit.
    pub capacitance_freqs: Vec<f64>,
    /// Holding potentials (mV) for the joint channel-density fit.
    pub holding_potentials: Vec<f64>,
    /// Rescale fitted capacitances so their total matches the full tree.
    pub preserve_total_capacitance: bool,
    /// Iteration budget of the non-negative least-squares solves.
    pub nnls_max_iterations: usize,
    /// Dual-feasibility tolerance of the non-negative least squares.
    pub nnls_tolerance: f64,
    /// Operating-point solver settings.
    pub equilibrium: EquilibriumConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            fit_tolerance: 1e-2,
            capacitance_freqs: vec![100.0, 300.0, 1.0e3, 3.0e3, 1.0e4],
            holding_potentials: vec![-75.0, -55.0, -35.0, -15.0],
            preserve_total_capacitance: false,
            nnls_max_iterations: 400,
            nnls_tolerance: 1e-11,
            equilibrium: EquilibriumConfig::default(),
        }
    }
}

/// Reduces a full tree to a compartmental model with matching transfer
/// properties.
pub struct CompartmentFitter<'a, T: MembranePayload + Sync> {
    tree: &'a Tree<T>,
    registry: &'a ChannelRegistry,
    config: FitConfig,
    cache: Option<&'a KernelCache>,
}

impl<'a, T: MembranePayload + Sync> CompartmentFitter<'a, T> {
    /// Fitter with default configuration and no cache.
    pub fn new(tree: &'a Tree<T>, registry: &'a ChannelRegistry) -> Self {
        CompartmentFitter {
            tree,
            registry,
            config: FitConfig::default(),
            cache: None,
        }
    }

    /// Override the fit configuration.
    pub fn with_config(mut self, config: FitConfig) -> Self {
        self.config = config;
        self
    }

    /// Memoize full-tree targets through a kernel cache.
    pub fn with_cache(mut self, cache: &'a KernelCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Non-leak channels attached anywhere on the tree, with their reversal
    /// potentials, sorted by name.
    fn channel_inventory(&self) -> Result<Vec<(String, f64)>> {
        let mut inventory: Vec<(String, f64)> = Vec::new();
        for node in self.tree.iter_pre_order() {
            for (name, density) in &node.payload.membrane().currents {
                if name == LEAK {
                    continue;
                }
                if !inventory.iter().any(|(n, _)| n == name) {
                    inventory.push((name.clone(), density.e));
                }
            }
        }
        inventory.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(inventory)
    }

    /// Full-tree impedance matrices at the given frequencies, memoized.
    fn target_matrices(
        &self,
        locs: &[Loc],
        freqs: &[C64],
        mode: ChannelMode,
        voltage: Option<f64>,
    ) -> Result<Vec<DMatrix<C64>>> {
        let compute = || -> Result<Vec<DMatrix<C64>>> {
            let mut solver = GreensSolver::new(self.tree, self.registry)?.with_mode(mode);
            if let Some(v) = voltage {
                solver = solver.with_voltage(v);
            }
            Ok(solver.impedance_matrix(locs, freqs)?)
        };
        let Some(cache) = self.cache else {
            return compute();
        };
        let params = serde_json::json!({
            "locs": locs,
            "freqs": freqs.iter().map(|s| (s.re, s.im)).collect::<Vec<_>>(),
            "mode": match mode {
                ChannelMode::Frozen => "frozen",
                ChannelMode::QuasiActive => "quasi_active",
            },
            "voltage": voltage,
        })
        .to_string();
        let key = KernelCache::compose_key(&[
            &tree_digest(self.tree),
            "impedance_matrix",
            &params,
        ]);
        let value = cache.get_or_compute(&key, || compute().map(CacheValue::Matrices))?;
        match value {
            CacheValue::Matrices(matrices) => Ok(matrices),
            _ => compute(),
        }
    }

    /// Fit a compartmental model to the tree at the given locations.
    pub fn fit_model(&self, locs: &[Loc]) -> Result<CompartmentTree> {
        let mut ctree = CompartmentTree::from_locations(self.tree, locs)?;
        let n = locs.len();
        let channels = self.channel_inventory()?;
        let mode = if channels.is_empty() {
            ChannelMode::Frozen
        } else {
            ChannelMode::QuasiActive
        };

        // --- Stage 1: conductances ------------------------------------
        let holdings: Vec<Option<f64>> = if channels.is_empty() {
            vec![None]
        } else {
            self.config.holding_potentials.iter().map(|&v| Some(v)).collect()
        };
        let targets: Vec<(Option<f64>, DMatrix<f64>)> = holdings
            .par_iter()
            .map(|&voltage| {
                let z = self
                    .target_matrices(locs, &[C64::new(0.0, 0.0)], mode, voltage)?
                    .remove(0);
                Ok((voltage, z.map(|v| v.re)))
            })
            .collect::<Result<_>>()?;

        // Edges of the reduced topology, child-side.
        let edges: Vec<(usize, usize)> = ctree
            .tree()
            .iter_pre_order()
            .filter_map(|node| {
                node.parent().map(|parent| {
                    (
                        node.payload.loc_idx,
                        ctree
                            .tree()
                            .payload(parent)
                            .expect("parent exists")
                            .loc_idx,
                    )
                })
            })
            .collect();
        let n_unknowns = edges.len() + n + channels.len() * n;
        let n_rows = targets.len() * n * n;
        let mut design = DMatrix::<f64>::zeros(n_rows, n_unknowns);
        let mut rhs = DVector::<f64>::zeros(n_rows);
        for (h, (voltage, z)) in targets.iter().enumerate() {
            // Differential channel conductances at the holding potential.
            let q: Vec<f64> = channels
                .iter()
                .map(|(name, e_rev)| {
                    let channel = self
                        .registry
                        .require(name)
                        .map_err(|_| cabletree_structures::TreeError::UnknownChannel(name.clone()))?;
                    let v = voltage.expect("holding potentials set when channels present");
                    Ok(channel
                        .linearized_admittance(v, *e_rev, C64::new(0.0, 0.0))
                        .re)
                })
                .collect::<Result<_>>()?;
            for i in 0..n {
                for j in 0..n {
                    let row = h * n * n + i * n + j;
                    for (k, &(child, parent)) in edges.iter().enumerate() {
                        if i == child {
                            design[(row, k)] = z[(child, j)] - z[(parent, j)];
                        } else if i == parent {
                            design[(row, k)] = z[(parent, j)] - z[(child, j)];
                        }
                    }
                    design[(row, edges.len() + i)] = z[(i, j)];
                    for (c, q_c) in q.iter().enumerate() {
                        design[(row, edges.len() + n + c * n + i)] = q_c * z[(i, j)];
                    }
                    rhs[row] = if i == j { 1.0 } else { 0.0 };
                }
            }
        }
        let conductances = nnls(
            &design,
            &rhs,
            self.config.nnls_max_iterations,
            self.config.nnls_tolerance,
        )?;
        debug!(n_unknowns, n_rows, "conductance stage solved");

        // Write conductances into the compartments.
        let node_indices: Vec<usize> =
            ctree.tree().iter_pre_order().map(|node| node.index()).collect();
        for index in node_indices {
            let loc_idx = ctree.tree().payload(index)?.loc_idx;
            let g_l = conductances[edges.len() + loc_idx];
            let g_c = edges
                .iter()
                .position(|&(child, _)| child == loc_idx)
                .map_or(0.0, |k| conductances[k]);
            let payload = ctree.tree_mut().payload_mut(index)?;
            payload.g_c = g_c;
            payload
                .currents
                .insert(LEAK.to_string(), CompartmentCurrent { g: g_l, e: 0.0 });
            for (c, (name, e_rev)) in channels.iter().enumerate() {
                payload.currents.insert(
                    name.clone(),
                    CompartmentCurrent {
                        g: conductances[edges.len() + n + c * n + loc_idx],
                        e: *e_rev,
                    },
                );
            }
        }

        // --- Stage 2: operating point and reversal potentials ----------
        let equilibrium =
            EquilibriumSolver::new(self.tree, self.registry, self.config.equilibrium.clone())
                .solve()?;
        let v_eq: Vec<f64> = locs
            .iter()
            .map(|&loc| Ok(equilibrium.at_loc(self.tree, loc)?))
            .collect::<Result<_>>()?;
        self.fit_reversals(&mut ctree, &edges, &v_eq)?;

        // --- Stage 3: capacitances -------------------------------------
        self.fit_capacitances(&mut ctree, locs)?;
        if self.config.preserve_total_capacitance {
            let mut ca_tree = 0.0;
            for node in self.tree.iter_pre_order() {
                ca_tree += node.payload.membrane().c_m
                    * self.tree.membrane_area(node.index())?;
            }
            let ca_fit = ctree.total_capacitance();
            if ca_fit > 0.0 {
                let factor = ca_tree / ca_fit;
                let indices: Vec<usize> =
                    ctree.tree().iter_pre_order().map(|node| node.index()).collect();
                for index in indices {
                    ctree.tree_mut().payload_mut(index)?.ca *= factor;
                }
            }
        }

        // --- Stage 4: verification -------------------------------------
        let z_target = self
            .target_matrices(locs, &[C64::new(0.0, 0.0)], mode, None)?
            .remove(0)
            .map(|v| v.re);
        let z_fit = ctree.steady_state_impedance(self.registry, mode)?;
        let residual = (&z_fit - &z_target).norm() / z_target.norm();
        info!(residual, tolerance = self.config.fit_tolerance, "reduction fitted");
        if residual > self.config.fit_tolerance {
            return Err(FitError::FitFailure {
                residual,
                tolerance: self.config.fit_tolerance,
                iterations: 1,
                remedy: format!(
                    "the {n}-compartment topology cannot represent the target kernels; \
                     add compartments or fit at more frequencies"
                ),
            });
        }
        Ok(ctree)
    }

    /// Choose leak reversal potentials so the reduced model is at
    /// equilibrium at the full tree's operating point.
    fn fit_reversals(
        &self,
        ctree: &mut CompartmentTree,
        edges: &[(usize, usize)],
        v_eq: &[f64],
    ) -> Result<()> {
        let node_indices: Vec<usize> =
            ctree.tree().iter_pre_order().map(|node| node.index()).collect();
        for index in node_indices {
            let payload = ctree.tree().payload(index)?.clone();
            let i = payload.loc_idx;
            let v = v_eq[i];
            let mut i_axial = 0.0;
            for &(child, parent) in edges {
                let g_c = ctree
                    .tree()
                    .iter_pre_order()
                    .find(|node| node.payload.loc_idx == child)
                    .map(|node| node.payload.g_c)
                    .unwrap_or(0.0);
                if child == i {
                    i_axial += g_c * (v - v_eq[parent]);
                } else if parent == i {
                    i_axial += g_c * (v - v_eq[child]);
                }
            }
            let mut i_channels = 0.0;
            for (name, current) in &payload.currents {
                if name == LEAK {
                    continue;
                }
                let channel = self
                    .registry
                    .require(name)
                    .map_err(|_| cabletree_structures::TreeError::UnknownChannel(name.clone()))?;
                i_channels += current.g * channel.open_probability_inf(v) * (v - current.e);
            }
            let g_l = payload.currents.get(LEAK).map_or(0.0, |c| c.g);
            let e_l = if g_l > 1e-12 {
                v + (i_axial + i_channels) / g_l
            } else {
                v
            };
            let node = ctree.tree_mut().payload_mut(index)?;
            node.v_ep = v;
            if let Some(leak) = node.currents.get_mut(LEAK) {
                leak.e = e_l;
            }
        }
        Ok(())
    }

    /// Fit compartment capacitances from the system residual at non-zero
    /// frequencies.
    fn fit_capacitances(&self, ctree: &mut CompartmentTree, locs: &[Loc]) -> Result<()> {
        let n = locs.len();
        let freqs: Vec<C64> = self
            .config
            .capacitance_freqs
            .iter()
            .map(|&w| C64::new(0.0, w))
            .collect();
        if freqs.is_empty() {
            return Err(FitError::InvalidLocations(
                "capacitance fit needs at least one frequency".into(),
            ));
        }
        let targets = self.target_matrices(locs, &freqs, ChannelMode::Frozen, None)?;
        let g0 = ctree.system_matrix(C64::new(0.0, 0.0), self.registry, ChannelMode::Frozen)?;

        let n_rows = 2 * freqs.len() * n * n;
        let mut design = DMatrix::<f64>::zeros(n_rows, n);
        let mut rhs = DVector::<f64>::zeros(n_rows);
        for (f, (s, z)) in freqs.iter().zip(&targets).enumerate() {
            let residue = DMatrix::<C64>::identity(n, n) - &g0 * z;
            for i in 0..n {
                for j in 0..n {
                    let row = 2 * (f * n * n + i * n + j);
                    let coeff = *s * z[(i, j)];
                    design[(row, i)] = coeff.re;
                    design[(row + 1, i)] = coeff.im;
                    rhs[row] = residue[(i, j)].re;
                    rhs[row + 1] = residue[(i, j)].im;
                }
            }
        }
        let ca = nnls(
            &design,
            &rhs,
            self.config.nnls_max_iterations,
            self.config.nnls_tolerance,
        )?;
        let node_indices: Vec<usize> =
            ctree.tree().iter_pre_order().map(|node| node.index()).collect();
        for index in node_indices {
            let loc_idx = ctree.tree().payload(index)?.loc_idx;
            ctree.tree_mut().payload_mut(index)?.ca = ca[loc_idx];
        }
        Ok(())
    }
}
