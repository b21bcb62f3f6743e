// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Neural evaluation tree.
//!
//! A hierarchy of voltage components at different spatial scales: each node
//! integrates a set of input locations through an impedance kernel, and the
//! kernel between two locations is the sum of the kernels on the path from
//! the root to their deepest common node. Built from a separation-of-
//! variables mode expansion; all node kernels share the expansion's pole
//! basis.

use ahash::AHashMap;
use nalgebra::DMatrix;
use tracing::debug;

use cabletree_structures::Tree;

use crate::error::{Result, SolverError};
use crate::kernel::ExpKernel;
use crate::sov::ModeExpansion;

/// Payload of a NET node.
#[derive(Debug, Clone)]
pub struct NetNode {
    /// Indices of the locations this node integrates.
    pub loc_idxs: Vec<usize>,
    /// Locations for which this node is the most local integrating
    /// component.
    pub new_loc_idxs: Vec<usize>,
    /// Impedance kernel of this spatial scale.
    pub kernel: ExpKernel,
}

/// Neural evaluation tree over a fixed location set.
#[derive(Debug, Clone)]
pub struct NetTree {
    tree: Tree<NetNode>,
    n_locs: usize,
}

impl NetTree {
    /// Underlying tree storage.
    pub fn tree(&self) -> &Tree<NetNode> {
        &self.tree
    }

    /// Number of locations the root integrates.
    pub fn n_locs(&self) -> usize {
        self.n_locs
    }

    /// Steady-state impedance of one node's kernel (MΩ).
    pub fn z_bar(&self, index: usize) -> Result<f64> {
        Ok(self.tree.payload(index)?.kernel.k_bar())
    }

    /// Build a NET from a mode expansion.
    ///
    /// At each level the shared component is the pairwise kernel with the
    /// smallest steady-state impedance within the location group; locations
    /// stay grouped while their residual coupling exceeds
    /// `coupling_tolerance` relative to their pairwise impedance.
    pub fn from_expansion(expansion: &ModeExpansion, coupling_tolerance: f64) -> Result<NetTree> {
        let n = expansion.n_locs();
        if n == 0 {
            return Err(SolverError::InvalidInput(
                "cannot build a NET from an empty expansion".into(),
            ));
        }
        let z_bar = expansion.steady_state_matrix();
        let all: Vec<usize> = (0..n).collect();
        let (root_kernel, _) = Self::shared_kernel(expansion, &z_bar, &all)?;
        let mut tree = Tree::new(NetNode {
            loc_idxs: all.clone(),
            new_loc_idxs: Vec::new(),
            kernel: root_kernel.clone(),
        });
        if n > 1 {
            let root_index = tree.root_index();
            Self::split_group(
                expansion,
                &z_bar,
                &mut tree,
                root_index,
                &all,
                &root_kernel,
                coupling_tolerance,
            )?;
        }
        let mut net = NetTree { tree, n_locs: n };
        net.set_new_loc_idxs();
        Ok(net)
    }

    /// Shared kernel of a location group: the smallest pairwise kernel, or
    /// the input kernel for a singleton.
    fn shared_kernel(
        expansion: &ModeExpansion,
        z_bar: &DMatrix<f64>,
        group: &[usize],
    ) -> Result<(ExpKernel, f64)> {
        if group.len() == 1 {
            let i = group[0];
            return Ok((expansion.kernel(i, i)?, z_bar[(i, i)]));
        }
        let mut best = (group[0], group[1]);
        let mut best_z = f64::INFINITY;
        for (a, &i) in group.iter().enumerate() {
            for &j in &group[a + 1..] {
                if z_bar[(i, j)] < best_z {
                    best_z = z_bar[(i, j)];
                    best = (i, j);
                }
            }
        }
        Ok((expansion.kernel(best.0, best.1)?, best_z))
    }

    fn split_group(
        expansion: &ModeExpansion,
        z_bar: &DMatrix<f64>,
        tree: &mut Tree<NetNode>,
        parent: usize,
        group: &[usize],
        acc_kernel: &ExpKernel,
        tolerance: f64,
    ) -> Result<()> {
        let acc_z = acc_kernel.k_bar();
        // Connected components of the residual coupling graph.
        let mut component = vec![usize::MAX; group.len()];
        let mut n_components = 0;
        for start in 0..group.len() {
            if component[start] != usize::MAX {
                continue;
            }
            let mut stack = vec![start];
            component[start] = n_components;
            while let Some(a) = stack.pop() {
                for b in 0..group.len() {
                    if component[b] != usize::MAX {
                        continue;
                    }
                    let z = z_bar[(group[a], group[b])];
                    if (z - acc_z) > tolerance * z.abs().max(1e-12) {
                        component[b] = n_components;
                        stack.push(b);
                    }
                }
            }
            n_components += 1;
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n_components];
        for (pos, &loc) in group.iter().enumerate() {
            groups[component[pos]].push(loc);
        }
        if groups.len() == 1 && groups[0].len() == group.len() && group.len() > 1 {
            // No further shared scale separates this group; attach the
            // remaining locations individually.
            debug!(size = group.len(), "group does not separate; splitting into singletons");
            groups = group.iter().map(|&loc| vec![loc]).collect();
        }

        for sub in groups {
            let (raw, _) = Self::shared_kernel(expansion, z_bar, &sub)?;
            let node_kernel = &raw - acc_kernel;
            let child = tree.insert(
                parent,
                NetNode {
                    loc_idxs: sub.clone(),
                    new_loc_idxs: Vec::new(),
                    kernel: node_kernel,
                },
            )?;
            if sub.len() > 1 {
                Self::split_group(expansion, z_bar, tree, child, &sub, &raw, tolerance)?;
            }
        }
        Ok(())
    }

    /// Recompute which locations each node integrates most locally.
    pub fn set_new_loc_idxs(&mut self) {
        let order: Vec<usize> = self.tree.iter_pre_order().map(|n| n.index()).collect();
        for index in order {
            let node = self.tree.find(index).expect("node exists");
            let mut covered: Vec<usize> = Vec::new();
            for &child in node.children() {
                covered.extend(
                    self.tree
                        .payload(child)
                        .expect("child exists")
                        .loc_idxs
                        .iter()
                        .copied(),
                );
            }
            let own: Vec<usize> = node
                .payload
                .loc_idxs
                .iter()
                .copied()
                .filter(|idx| !covered.contains(idx))
                .collect();
            self.tree
                .payload_mut(index)
                .expect("node exists")
                .new_loc_idxs = own;
        }
    }

    /// Node for which the location is newly integrated.
    pub fn leaf_node_for_loc(&self, loc_idx: usize) -> Option<usize> {
        self.tree
            .iter_pre_order()
            .find(|n| n.payload.new_loc_idxs.contains(&loc_idx))
            .map(|n| n.index())
    }

    /// Total impedance of a node: the sum of steady-state impedances on the
    /// path from the node to the root (MΩ).
    pub fn total_impedance(&self, index: usize) -> Result<f64> {
        let mut total = 0.0;
        for idx in self.tree.path_to_root(index)? {
            total += self.z_bar(idx)?;
        }
        Ok(total)
    }

    /// Total kernel of a node: the sum of kernels on the path to the root.
    pub fn total_kernel(&self, index: usize) -> Result<ExpKernel> {
        let path = self.tree.path_to_root(index)?;
        let mut kernel = self.tree.payload(path[0])?.kernel.clone();
        for &idx in &path[1..] {
            kernel = &kernel + &self.tree.payload(idx)?.kernel;
        }
        Ok(kernel)
    }

    /// Impedance-matrix approximation carried by the NET (MΩ).
    pub fn impedance_matrix(&self) -> Result<DMatrix<f64>> {
        let root = self.tree.root_index();
        let loc_map: AHashMap<usize, usize> = self
            .tree
            .payload(root)?
            .loc_idxs
            .iter()
            .enumerate()
            .map(|(pos, &loc)| (loc, pos))
            .collect();
        let n = loc_map.len();
        let mut matrix = DMatrix::<f64>::zeros(n, n);
        for node in self.tree.iter_pre_order() {
            let z = node.payload.kernel.k_bar();
            for &a in &node.payload.loc_idxs {
                for &b in &node.payload.loc_idxs {
                    matrix[(loc_map[&a], loc_map[&b])] += z;
                }
            }
        }
        Ok(matrix)
    }

    /// Impedance-based independence measure between all location pairs:
    /// `(z_in_i + z_in_j) / (2 z_ij) - 1`.
    pub fn iz_matrix(&self) -> Result<DMatrix<f64>> {
        let z = self.impedance_matrix()?;
        let n = z.nrows();
        let mut iz = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    iz[(i, j)] = (z[(i, i)] + z[(j, j)]) / (2.0 * z[(i, j)]) - 1.0;
                }
            }
        }
        Ok(iz)
    }

    /// Independence measure between two locations, evaluated on the reduced
    /// tree that retains only the pair.
    pub fn iz(&self, loc_a: usize, loc_b: usize) -> Result<f64> {
        let reduced = self
            .reduced_tree(&[loc_a, loc_b])?
            .ok_or_else(|| SolverError::InvalidInput("locations not in the tree".into()))?;
        let root = reduced.tree.root_index();
        let z_root = reduced.z_bar(root)?;
        let z_of = |loc: usize| -> Result<f64> {
            match reduced.leaf_node_for_loc(loc) {
                Some(node) if node != root => reduced.z_bar(node),
                _ => Ok(0.0),
            }
        };
        Ok((z_of(loc_a)? + z_of(loc_b)?) / (2.0 * z_root))
    }

    /// Reduced NET retaining only the given locations. Returns `None` when
    /// none of the locations are present.
    pub fn reduced_tree(&self, loc_idxs: &[usize]) -> Result<Option<NetTree>> {
        let root = self.tree.root_index();
        let root_payload = self.tree.payload(root)?;
        let mut kept: Vec<usize> = loc_idxs
            .iter()
            .copied()
            .filter(|idx| root_payload.loc_idxs.contains(idx))
            .collect();
        kept.sort_unstable();
        kept.dedup();
        if kept.is_empty() {
            return Ok(None);
        }
        let mut tree = Tree::new(NetNode {
            loc_idxs: kept.clone(),
            new_loc_idxs: Vec::new(),
            kernel: root_payload.kernel.clone(),
        });
        let children: Vec<usize> = self.tree.find(root)?.children().to_vec();
        for child in children {
            self.reduce_into(child, &kept, tree.root_index(), &mut tree)?;
        }
        let mut net = NetTree {
            tree,
            n_locs: kept.len(),
        };
        net.set_new_loc_idxs();
        Ok(Some(net))
    }

    fn reduce_into(
        &self,
        node: usize,
        kept: &[usize],
        target: usize,
        out: &mut Tree<NetNode>,
    ) -> Result<()> {
        let payload = self.tree.payload(node)?;
        let mut subtree_locs: Vec<usize> = kept
            .iter()
            .copied()
            .filter(|idx| payload.loc_idxs.contains(idx))
            .collect();
        subtree_locs.sort_unstable();
        if subtree_locs.is_empty() {
            return Ok(());
        }
        let target_locs = {
            let mut locs = out.payload(target)?.loc_idxs.clone();
            locs.sort_unstable();
            locs
        };
        let next_target = if subtree_locs == target_locs {
            // Same location content: merge this scale into the target node.
            let merged = &out.payload(target)?.kernel + &payload.kernel;
            out.payload_mut(target)?.kernel = merged;
            target
        } else {
            out.insert(
                target,
                NetNode {
                    loc_idxs: subtree_locs,
                    new_loc_idxs: Vec::new(),
                    kernel: payload.kernel.clone(),
                },
            )?
        };
        let children: Vec<usize> = self.tree.find(node)?.children().to_vec();
        for child in children {
            self.reduce_into(child, kept, next_target, out)?;
        }
        Ok(())
    }

    /// Compartmentalization at a given independence threshold: the node
    /// indices rooting compartments whose independent impedance exceeds
    /// `iz` times the impedance they share with the rest of the tree.
    pub fn compartmentalize(&self, iz: f64) -> Result<Vec<usize>> {
        let mut compartments: Vec<usize> = Vec::new();
        for leaf in self.tree.leaves() {
            if self.tree.is_root(leaf) {
                continue;
            }
            let path = self.tree.path_to_root(leaf)?;
            // Walk from the leaf towards the root; keep the highest node
            // whose independent impedance clears the threshold.
            let mut z_independent = 0.0;
            let mut best: Option<usize> = None;
            for (pos, &node) in path.iter().enumerate() {
                if self.tree.is_root(node) {
                    break;
                }
                z_independent += self.z_bar(node)?;
                let mut z_shared = 0.0;
                for &ancestor in &path[pos + 1..] {
                    z_shared += self.z_bar(ancestor)?;
                }
                if z_shared > 0.0 && z_independent / z_shared >= iz {
                    best = Some(node);
                }
            }
            if let Some(node) = best {
                if !compartments.contains(&node) {
                    compartments.push(node);
                }
            }
        }
        // Drop compartment roots that contain another compartment root in
        // their subtree path (keep the more local one).
        let mut filtered = Vec::new();
        for &a in &compartments {
            let mut is_ancestor = false;
            for &b in &compartments {
                if a != b && self.tree.path_to_root(b)?[1..].contains(&a) {
                    is_ancestor = true;
                    break;
                }
            }
            if !is_ancestor {
                filtered.push(a);
            }
        }
        filtered.sort_unstable();
        Ok(filtered)
    }

    /// Rescale node kernels so the NET's input impedances match the given
    /// target matrix diagonal.
    pub fn improve_input_resistance(&mut self, z_mat: &DMatrix<f64>) -> Result<()> {
        let order: Vec<usize> = self.tree.iter_pre_order().map(|n| n.index()).collect();
        for index in order {
            let payload = self.tree.payload(index)?.clone();
            if payload.loc_idxs.len() == 1 {
                let loc = payload.loc_idxs[0];
                let parent_kernel = match self.tree.parent_of(index)? {
                    Some(parent) => Some(self.total_kernel(parent)?),
                    None => None,
                };
                let p_bar = parent_kernel.as_ref().map_or(0.0, ExpKernel::k_bar);
                let deficit = z_mat[(loc, loc)] - p_bar;
                let z_own = payload.kernel.k_bar();
                let node = self.tree.payload_mut(index)?;
                if z_own.abs() > 1e-12 {
                    let factor = deficit / z_own;
                    for c in &mut node.kernel.c {
                        *c *= factor;
                    }
                } else {
                    // Degenerate scale: rebuild the kernel on its own rate
                    // basis with the required surface.
                    let a0 = node.kernel.a[0];
                    node.kernel.c = vec![crate::kernel::C64::new(0.0, 0.0); node.kernel.a.len()];
                    node.kernel.c[0] = a0 * deficit;
                }
            } else if !payload.new_loc_idxs.is_empty() {
                let z_approx = self.total_kernel(index)?.k_bar();
                let z_own = payload.kernel.k_bar();
                let mut assigned = Vec::new();
                for &loc in &payload.new_loc_idxs {
                    let deficit = z_mat[(loc, loc)] - z_approx;
                    if deficit.abs() > 1e-7 && z_own.abs() > 1e-12 {
                        let factor = deficit / z_own;
                        let mut kernel = payload.kernel.clone();
                        for c in &mut kernel.c {
                            *c *= factor;
                        }
                        self.tree.insert(
                            index,
                            NetNode {
                                loc_idxs: vec![loc],
                                new_loc_idxs: vec![loc],
                                kernel,
                            },
                        )?;
                        assigned.push(loc);
                    }
                }
                self.tree
                    .payload_mut(index)?
                    .new_loc_idxs
                    .retain(|loc| !assigned.contains(loc));
            }
        }
        self.set_new_loc_idxs();
        Ok(())
    }

    /// Shunt-factor sweep: given input conductances per location, compute
    /// the factor by which each location's effective input is rescaled by
    /// the shared impedance scales.
    pub fn conductance_rescale(&self, gs: &[f64]) -> Result<Vec<f64>> {
        let root = self.tree.root_index();
        if gs.len() != self.tree.payload(root)?.loc_idxs.len() {
            return Err(SolverError::InvalidInput(format!(
                "conductance vector length {} does not match location count {}",
                gs.len(),
                self.tree.payload(root)?.loc_idxs.len()
            )));
        }
        let mut sfs = vec![1.0; gs.len()];
        for node in self.tree.iter_post_order() {
            if self.tree.is_root(node.index()) {
                continue;
            }
            let z = node.payload.kernel.k_bar();
            let coupling: f64 = node
                .payload
                .loc_idxs
                .iter()
                .map(|&i| sfs[i] * gs[i])
                .sum();
            let denom = 1.0 + z * coupling;
            for &i in &node.payload.loc_idxs {
                sfs[i] /= denom;
            }
        }
        Ok(sfs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    /// Star expansion: location 0 at the shared scale, locations 1 and 2 on
    /// independent branches. Single mode with α = 1/ms, so residues equal
    /// steady-state impedances.
    fn star_expansion() -> ModeExpansion {
        ModeExpansion {
            alphas: vec![1.0],
            residues: vec![dmatrix![
                1.0, 1.0, 1.0;
                1.0, 3.0, 1.0;
                1.0, 1.0, 4.0;
            ]],
        }
    }

    #[test]
    fn test_net_reproduces_expansion_matrix() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        let z = net.impedance_matrix().unwrap();
        let expected = star_expansion().steady_state_matrix();
        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    (z[(i, j)] - expected[(i, j)]).abs() < 1e-9,
                    "({i},{j}): {} vs {}",
                    z[(i, j)],
                    expected[(i, j)]
                );
            }
        }
    }

    #[test]
    fn test_new_loc_idxs_partition_locations() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        let mut seen: Vec<usize> = Vec::new();
        for node in net.tree().iter_pre_order() {
            seen.extend(node.payload.new_loc_idxs.iter().copied());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(net.leaf_node_for_loc(1).is_some());
    }

    #[test]
    fn test_iz_measures_independence() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        // Branch locations share only the root scale of 1 MΩ.
        let iz = net.iz(1, 2).unwrap();
        assert!((iz - (2.0 + 3.0) / 2.0).abs() < 1e-9);
        let iz_mat = net.iz_matrix().unwrap();
        assert!((iz_mat[(1, 2)] - ((3.0 + 4.0) / 2.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_reduced_tree_keeps_pair() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        let reduced = net.reduced_tree(&[1, 2]).unwrap().unwrap();
        assert_eq!(reduced.n_locs(), 2);
        let z = reduced.impedance_matrix().unwrap();
        assert!((z[(0, 0)] - 3.0).abs() < 1e-9);
        assert!((z[(0, 1)] - 1.0).abs() < 1e-9);
        assert!(net.reduced_tree(&[99]).unwrap().is_none());
    }

    #[test]
    fn test_compartmentalization_threshold() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        // Both branches clear a threshold of 2 (ratios 2 and 3).
        let comps = net.compartmentalize(2.0).unwrap();
        assert_eq!(comps.len(), 2);
        // Nothing clears an extreme threshold.
        let comps = net.compartmentalize(10.0).unwrap();
        assert!(comps.is_empty());
    }

    #[test]
    fn test_improve_input_resistance_matches_diagonal() {
        let mut net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        let target = dmatrix![
            1.5, 1.0, 1.0;
            1.0, 3.5, 1.0;
            1.0, 1.0, 4.25;
        ];
        net.improve_input_resistance(&target).unwrap();
        let z = net.impedance_matrix().unwrap();
        for i in 0..3 {
            assert!(
                (z[(i, i)] - target[(i, i)]).abs() < 1e-9,
                "diag {i}: {} vs {}",
                z[(i, i)],
                target[(i, i)]
            );
        }
    }

    #[test]
    fn test_conductance_rescale_shrinks_factors() {
        let net = NetTree::from_expansion(&star_expansion(), 1e-3).unwrap();
        let sfs = net.conductance_rescale(&[0.1, 0.1, 0.1]).unwrap();
        // Location 0 sits on a zero-impedance scale and keeps its factor.
        assert!((sfs[0] - 1.0).abs() < 1e-12);
        // A location with a larger independent impedance is shunted more.
        assert!(sfs[2] < sfs[1]);
        assert!(sfs[1] < sfs[0]);
    }
}
