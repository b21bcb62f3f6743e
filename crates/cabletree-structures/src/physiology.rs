// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Physiological capability: membrane parameters on top of the morphology.
//!
//! Each node carries a [`Membrane`] component next to its [`Geometry`]:
//! specific capacitance, axial resistivity, a point shunt, the expansion
//! (equilibrium) potential and the attached membrane currents. Channel
//! models themselves live in a [`ChannelRegistry`]; nodes only store
//! densities and reversal potentials by channel name.
//!
//! Units: µF/cm² (c_m), MΩ·cm (r_a), µS/cm² (densities), µS (point shunt),
//! mV (potentials).

use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use cabletree_channels::{ChannelRegistry, IonChannel};

use crate::error::{Result, TreeError};
use crate::morphology::{Geometry, GeometryPayload, Loc, MorphRecord, MorphTree, StructureKind};
use crate::tree::Tree;

/// Name of the distinguished passive leak current.
pub const LEAK: &str = "leak";

/// Density and reversal potential of one membrane current on one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelDensity {
    /// Maximal conductance density (µS/cm²).
    pub g: f64,
    /// Reversal potential (mV).
    pub e: f64,
}

/// Electrical membrane parameters of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membrane {
    /// Specific membrane capacitance (µF/cm²).
    pub c_m: f64,
    /// Axial resistivity (MΩ·cm).
    pub r_a: f64,
    /// Point shunt conductance at the node's distal point (µS).
    pub g_shunt: f64,
    /// Expansion (equilibrium) potential (mV).
    pub v_ep: f64,
    /// Membrane currents by channel name.
    pub currents: AHashMap<String, ChannelDensity>,
}

impl Default for Membrane {
    fn default() -> Self {
        Membrane {
            c_m: 1.0,
            r_a: 100.0e-6, // 100 Ω·cm
            g_shunt: 0.0,
            v_ep: -75.0,
            currents: AHashMap::new(),
        }
    }
}

/// Node payload combining the geometric and electrical capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysNode {
    /// Node index in the source record stream.
    pub source_index: i64,
    /// Structure kind tag.
    pub kind: StructureKind,
    /// Geometry component.
    pub geometry: Geometry,
    /// Membrane component.
    pub membrane: Membrane,
}

impl GeometryPayload for PhysNode {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn geometry_mut(&mut self) -> &mut Geometry {
        &mut self.geometry
    }
}

/// Payload kinds exposing membrane parameters.
pub trait MembranePayload: GeometryPayload {
    /// Immutable access to the membrane component.
    fn membrane(&self) -> &Membrane;
    /// Mutable access to the membrane component.
    fn membrane_mut(&mut self) -> &mut Membrane;
}

impl MembranePayload for PhysNode {
    fn membrane(&self) -> &Membrane {
        &self.membrane
    }

    fn membrane_mut(&mut self) -> &mut Membrane {
        &mut self.membrane
    }
}

/// Tree of physiological nodes.
pub type PhysTree = Tree<PhysNode>;

/// Derive a physiological tree from a morphology (canonical
/// copy-construction; default membrane everywhere).
pub fn phys_tree_from_morph(morph: &MorphTree) -> PhysTree {
    morph.map_payload(|_, node| PhysNode {
        source_index: node.source_index,
        kind: node.kind,
        geometry: node.geometry.clone(),
        membrane: Membrane::default(),
    })
}

/// Build a physiological tree directly from interchange records.
pub fn phys_tree_from_records(records: &[MorphRecord]) -> Result<PhysTree> {
    Ok(phys_tree_from_morph(&crate::morphology::morph_tree_from_records(records)?))
}

impl<T: MembranePayload> Tree<T> {
    fn distances_to_soma(&self) -> Result<Vec<(usize, f64)>> {
        self.iter_pre_order()
            .map(|node| {
                let d = self.distance_to_soma(Loc::distal(node.index()))?;
                Ok((node.index(), d))
            })
            .collect()
    }

    /// Set uniform passive parameters on every node.
    pub fn set_physiology(&mut self, c_m: f64, r_a: f64) -> Result<()> {
        self.set_physiology_with(|_| c_m, |_| r_a)
    }

    /// Set passive parameters as functions of path distance to the soma (cm).
    pub fn set_physiology_with(
        &mut self,
        c_m: impl Fn(f64) -> f64,
        r_a: impl Fn(f64) -> f64,
    ) -> Result<()> {
        for (index, d) in self.distances_to_soma()? {
            let (c, r) = (c_m(d), r_a(d));
            if c <= 0.0 || r <= 0.0 {
                return Err(TreeError::InvalidOperation(format!(
                    "non-positive membrane parameters at node {index}: c_m = {c}, r_a = {r}"
                )));
            }
            let membrane = self.payload_mut(index)?.membrane_mut();
            membrane.c_m = c;
            membrane.r_a = r;
        }
        Ok(())
    }

    /// Set a uniform leak current.
    pub fn set_leak(&mut self, g: f64, e: f64) -> Result<()> {
        self.set_leak_with(|_| g, |_| e)
    }

    /// Set the leak current as a function of path distance to the soma.
    pub fn set_leak_with(
        &mut self,
        g: impl Fn(f64) -> f64,
        e: impl Fn(f64) -> f64,
    ) -> Result<()> {
        for (index, d) in self.distances_to_soma()? {
            let density = ChannelDensity { g: g(d), e: e(d) };
            if density.g < 0.0 {
                return Err(TreeError::InvalidOperation(format!(
                    "negative leak conductance at node {index}: {}",
                    density.g
                )));
            }
            self.payload_mut(index)?
                .membrane_mut()
                .currents
                .insert(LEAK.to_string(), density);
        }
        Ok(())
    }

    /// Set the expansion potential on every node.
    pub fn set_v_ep(&mut self, v: f64) -> Result<()> {
        self.set_v_ep_with(|_| v)
    }

    /// Set the expansion potential as a function of distance to the soma.
    pub fn set_v_ep_with(&mut self, v: impl Fn(f64) -> f64) -> Result<()> {
        for (index, d) in self.distances_to_soma()? {
            self.payload_mut(index)?.membrane_mut().v_ep = v(d);
        }
        Ok(())
    }

    /// Attach a channel with a uniform density, registering its model.
    pub fn add_channel(
        &mut self,
        channel: Arc<dyn IonChannel>,
        g_max: f64,
        e_rev: f64,
        registry: &mut ChannelRegistry,
    ) -> Result<()> {
        self.add_channel_with(channel, |_| g_max, e_rev, registry)
    }

    /// Attach a channel with a density profile over distance to the soma.
    pub fn add_channel_with(
        &mut self,
        channel: Arc<dyn IonChannel>,
        g_max: impl Fn(f64) -> f64,
        e_rev: f64,
        registry: &mut ChannelRegistry,
    ) -> Result<()> {
        let name = channel.name().to_string();
        registry.register(channel);
        for (index, d) in self.distances_to_soma()? {
            let g = g_max(d);
            if g < 0.0 {
                return Err(TreeError::InvalidOperation(format!(
                    "negative channel density for '{name}' at node {index}: {g}"
                )));
            }
            self.payload_mut(index)?
                .membrane_mut()
                .currents
                .insert(name.clone(), ChannelDensity { g, e: e_rev });
        }
        Ok(())
    }

    /// Total frozen membrane conductance density of a node at voltage `v`
    /// (µS/cm², leak included).
    pub fn total_conductance_density(
        &self,
        index: usize,
        v: f64,
        registry: &ChannelRegistry,
    ) -> Result<f64> {
        let membrane = self.payload(index)?.membrane();
        let mut g_total = 0.0;
        for (name, density) in &membrane.currents {
            if name == LEAK {
                g_total += density.g;
            } else {
                let channel = registry
                    .require(name)
                    .map_err(|_| TreeError::UnknownChannel(name.clone()))?;
                g_total += density.g * channel.open_probability_inf(v);
            }
        }
        Ok(g_total)
    }

    /// Total membrane current density of a node at voltage `v` (steady-state
    /// gates; µA-scale per cm², positive outward).
    pub fn total_current_density(
        &self,
        index: usize,
        v: f64,
        registry: &ChannelRegistry,
    ) -> Result<f64> {
        let membrane = self.payload(index)?.membrane();
        let mut i_total = 0.0;
        for (name, density) in &membrane.currents {
            let p_open = if name == LEAK {
                1.0
            } else {
                registry
                    .require(name)
                    .map_err(|_| TreeError::UnknownChannel(name.clone()))?
                    .open_probability_inf(v)
            };
            i_total += density.g * p_open * (v - density.e);
        }
        Ok(i_total)
    }

    /// Choose each node's leak so that the local membrane time constant is
    /// `tau_m` (ms) and the equilibrium sits at `v_eq` (mV).
    ///
    /// When the requested time constant cannot be reached with a
    /// non-negative leak the leak is clamped and a warning is emitted.
    pub fn fit_leak_current(
        &mut self,
        registry: &ChannelRegistry,
        v_eq: f64,
        tau_m: f64,
    ) -> Result<()> {
        if tau_m <= 0.0 {
            return Err(TreeError::InvalidOperation(format!(
                "membrane time constant must be positive, got {tau_m}"
            )));
        }
        let indices: Vec<usize> = self.iter_pre_order().map(|n| n.index()).collect();
        for index in indices {
            let membrane = self.payload(index)?.membrane();
            let c_m = membrane.c_m;
            let mut g_chan = 0.0;
            let mut i_chan = 0.0;
            for (name, density) in &membrane.currents {
                if name == LEAK {
                    continue;
                }
                let channel = registry
                    .require(name)
                    .map_err(|_| TreeError::UnknownChannel(name.clone()))?;
                let p_open = channel.open_probability_inf(v_eq);
                g_chan += density.g * p_open;
                i_chan += density.g * p_open * (v_eq - density.e);
            }
            // τ[ms] = c_m[µF/cm²] / g_tot[µS/cm²] · 1e3
            let mut g_leak = c_m / (tau_m * 1e-3) - g_chan;
            if g_leak <= 0.0 {
                warn!(
                    node = index,
                    tau_m,
                    g_chan,
                    "requested membrane time constant unreachable with non-negative leak; clamping"
                );
                g_leak = 1e-10;
            }
            let e_leak = v_eq + i_chan / g_leak;
            let membrane = self.payload_mut(index)?.membrane_mut();
            membrane
                .currents
                .insert(LEAK.to_string(), ChannelDensity { g: g_leak, e: e_leak });
            membrane.v_ep = v_eq;
        }
        Ok(())
    }

    /// Fold channels into the leak, frozen at each node's expansion
    /// potential.
    ///
    /// With `channel_names = None` every non-leak current is folded. The
    /// node's total membrane current at `v_ep` is preserved, so an
    /// equilibrated tree stays equilibrated. Computational view marks are
    /// invalidated.
    pub fn as_passive_membrane(
        &mut self,
        registry: &ChannelRegistry,
        channel_names: Option<&[&str]>,
    ) -> Result<()> {
        let indices: Vec<usize> = self.iter_pre_order().map(|n| n.index()).collect();
        for index in indices {
            let membrane = self.payload(index)?.membrane();
            let v = membrane.v_ep;
            let selected: Vec<String> = membrane
                .currents
                .keys()
                .filter(|name| {
                    name.as_str() != LEAK
                        && channel_names.map_or(true, |sel| sel.contains(&name.as_str()))
                })
                .cloned()
                .collect();
            let leak = membrane.currents.get(LEAK).copied().unwrap_or(ChannelDensity {
                g: 0.0,
                e: v,
            });
            let mut g_new = leak.g;
            let mut i_at_v = leak.g * (v - leak.e);
            for name in &selected {
                let density = membrane.currents[name];
                let p_open = registry
                    .require(name)
                    .map_err(|_| TreeError::UnknownChannel(name.clone()))?
                    .open_probability_inf(v);
                g_new += density.g * p_open;
                i_at_v += density.g * p_open * (v - density.e);
            }
            let e_new = if g_new > 0.0 { v - i_at_v / g_new } else { v };
            let membrane = self.payload_mut(index)?.membrane_mut();
            for name in &selected {
                membrane.currents.remove(name);
            }
            membrane
                .currents
                .insert(LEAK.to_string(), ChannelDensity { g: g_new, e: e_new });
        }
        self.clear_view_marks();
        Ok(())
    }

    /// Mark the computational node set: root, leaves, branch points, nodes
    /// whose segment parameters differ from their single child's beyond
    /// `eps`, and nodes carrying a point shunt.
    pub fn mark_computational_nodes(&mut self, eps: f64) -> Result<()> {
        let mut marked = Vec::new();
        for node in self.iter_pre_order() {
            let index = node.index();
            if self.is_root(index) {
                continue; // always marked implicitly
            }
            let children = node.children();
            let keep = match children {
                [] => true,
                [child] => {
                    self.payload(index)?.membrane().g_shunt != 0.0
                        || !self.segments_mergeable(index, *child, eps)?
                }
                _ => true,
            };
            if keep {
                marked.push(index);
            }
        }
        self.set_view_marks(&marked)
    }

    fn segments_mergeable(&self, node: usize, child: usize, eps: f64) -> Result<bool> {
        let a = self.payload(node)?;
        let b = self.payload(child)?;
        let (ga, gb) = (a.geometry(), b.geometry());
        let (ma, mb) = (a.membrane(), b.membrane());
        if (ga.radius - gb.radius).abs() > eps
            || (ma.c_m - mb.c_m).abs() > eps
            || (ma.r_a - mb.r_a).abs() > eps
            || (ma.v_ep - mb.v_ep).abs() > eps
        {
            return Ok(false);
        }
        if ma.currents.len() != mb.currents.len() {
            return Ok(false);
        }
        for (name, da) in &ma.currents {
            match mb.currents.get(name) {
                Some(db) if (da.g - db.g).abs() <= eps && (da.e - db.e).abs() <= eps => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morphology::UM;
    use cabletree_channels::collection::CalibrationChannel;

    /// Straight chain with evenly spaced nodes, 50 µm apart:
    /// soma -- 1 -- 2 -- 3 -- 4.
    fn chain_tree() -> PhysTree {
        let records = vec![
            MorphRecord { index: 1, kind: 1, x: 0.0, y: 0.0, z: 0.0, radius: 10.0, parent: -1 },
            MorphRecord { index: 2, kind: 3, x: 50.0, y: 0.0, z: 0.0, radius: 1.0, parent: 1 },
            MorphRecord { index: 3, kind: 3, x: 100.0, y: 0.0, z: 0.0, radius: 1.0, parent: 2 },
            MorphRecord { index: 4, kind: 3, x: 150.0, y: 0.0, z: 0.0, radius: 1.0, parent: 3 },
            MorphRecord { index: 5, kind: 3, x: 200.0, y: 0.0, z: 0.0, radius: 1.0, parent: 4 },
        ];
        phys_tree_from_records(&records).unwrap()
    }

    #[test]
    fn test_physiology_setters() {
        let mut tree = chain_tree();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(100.0, -75.0).unwrap();
        tree.set_v_ep(-75.0).unwrap();
        for node in tree.iter_pre_order() {
            assert!((node.payload.membrane.c_m - 1.0).abs() < 1e-12);
            let leak = node.payload.membrane.currents[LEAK];
            assert!((leak.g - 100.0).abs() < 1e-12);
        }
        // Distance-dependent profile.
        tree.set_physiology_with(|d| 0.5 * d / UM + 1.0, |_| 100.0e-6).unwrap();
        let c_at_2 = tree.payload(2).unwrap().membrane.c_m;
        assert!((c_at_2 - (0.5 * 100.0 + 1.0)).abs() < 1e-9);
        // Invalid values are rejected.
        assert!(tree.set_physiology(-1.0, 100.0e-6).is_err());
    }

    #[test]
    fn test_fit_leak_current() {
        let mut tree = chain_tree();
        let mut registry = ChannelRegistry::new();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        assert!(tree.fit_leak_current(&registry, -75.0, -10.0).is_err());
        tree.fit_leak_current(&registry, -75.0, 10.0).unwrap();
        for node in tree.iter_pre_order() {
            let leak = node.payload.membrane.currents[LEAK];
            assert!((leak.g - 1.0 / (10.0 * 1e-3)).abs() < 1e-9);
            assert!((node.payload.membrane.v_ep + 75.0).abs() < 1e-12);
        }

        // With a channel: time constant counts the frozen channel conductance
        // and the equilibrium balances the channel current.
        let channel = CalibrationChannel;
        let p_open = channel.open_probability_inf(-30.0);
        tree.add_channel(Arc::new(channel), 100.0, 100.0, &mut registry).unwrap();
        tree.fit_leak_current(&registry, -30.0, 10.0).unwrap();
        for node in tree.iter_pre_order() {
            let m = &node.payload.membrane;
            let g_l = m.currents[LEAK].g;
            let tau = m.c_m / (g_l + 100.0 * p_open) * 1e3;
            assert!((tau - 10.0).abs() < 1e-9);
            let i_tot = tree.total_current_density(node.index(), -30.0, &registry).unwrap();
            assert!(i_tot.abs() < 1e-9);
        }
    }

    #[test]
    fn test_as_passive_membrane() {
        let mut tree = chain_tree();
        let mut registry = ChannelRegistry::new();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.add_channel(Arc::new(CalibrationChannel), 100.0, 100.0, &mut registry)
            .unwrap();
        tree.fit_leak_current(&registry, -30.0, 10.0).unwrap();

        let g_total = tree
            .total_conductance_density(0, -30.0, &registry)
            .unwrap();
        tree.as_passive_membrane(&registry, None).unwrap();
        for node in tree.iter_pre_order() {
            let m = &node.payload.membrane;
            assert_eq!(m.currents.len(), 1);
            let leak = m.currents[LEAK];
            assert!((leak.g - g_total).abs() < 1e-9);
            assert!((leak.e - (-30.0)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_computational_marks_merge_uniform_stretches() {
        let mut tree = chain_tree();
        tree.set_physiology(1.0, 100.0e-6).unwrap();
        tree.set_leak(100.0, -75.0).unwrap();
        tree.mark_computational_nodes(1e-9).unwrap();
        tree.with_computational_view(|t| {
            let seen: Vec<usize> = t.iter_pre_order().map(|n| n.index()).collect();
            // Uniform chain collapses to soma + tip.
            assert_eq!(seen, vec![0, 4]);
        })
        .unwrap();

        // A capacitance step at 125 µm keeps the boundary node.
        tree.set_physiology_with(|d| if d < 125.0 * UM { 1.0 } else { 1.6 }, |_| 100.0e-6)
            .unwrap();
        tree.mark_computational_nodes(1e-9).unwrap();
        tree.with_computational_view(|t| {
            let seen: Vec<usize> = t.iter_pre_order().map(|n| n.index()).collect();
            assert_eq!(seen, vec![0, 2, 4]);
        })
        .unwrap();

        // A point shunt keeps its node.
        tree.payload_mut(3).unwrap().membrane.g_shunt = 1.0;
        tree.mark_computational_nodes(1e-9).unwrap();
        tree.with_computational_view(|t| {
            let seen: Vec<usize> = t.iter_pre_order().map(|n| n.index()).collect();
            assert_eq!(seen, vec![0, 2, 3, 4]);
        })
        .unwrap();
    }
}
