// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Generic rooted tree storage.
//!
//! `Tree<T>` owns all nodes in an arena; nodes refer to each other by index.
//! The payload type `T` carries the per-node data (geometry, membrane
//! parameters, compartment parameters), so the same storage and traversal
//! code backs every tree kind in the workspace. Derived tree kinds are
//! produced with [`Tree::map_payload`], which deep-copies the topology and
//! rebuilds all parent/child links from scratch.
//!
//! A tree optionally carries a *computational view*: a subset of nodes marked
//! as visible, merging unbranched stretches into single edges. While the view
//! is active every traversal and lookup sees only marked nodes; payloads are
//! never touched. Activation is scoped (closure or RAII guard) and the fine
//! view is restored on exit even when the closure panics.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use ahash::AHashMap;

use crate::error::{Result, TreeError};

/// A single node owned by a [`Tree`].
#[derive(Debug, Clone)]
pub struct TreeNode<T> {
    index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Per-node data.
    pub payload: T,
}

impl<T> TreeNode<T> {
    /// Index of this node, unique within its tree.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fine-view parent index (`None` for the root).
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Fine-view child indices, in insertion order.
    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

#[derive(Debug, Clone, Default)]
struct ViewState {
    active: bool,
    marked: Vec<bool>,
    view_parent: AHashMap<usize, Option<usize>>,
    view_children: AHashMap<usize, Vec<usize>>,
}

impl ViewState {
    fn has_marks(&self) -> bool {
        !self.view_parent.is_empty()
    }

    fn clear(&mut self) {
        self.active = false;
        self.marked.clear();
        self.view_parent.clear();
        self.view_children.clear();
    }
}

/// Generic rooted tree with arena storage and an optional coarse view.
#[derive(Debug, Clone)]
pub struct Tree<T> {
    nodes: Vec<Option<TreeNode<T>>>,
    root: usize,
    node_count: usize,
    view: ViewState,
}

impl<T> Tree<T> {
    /// Create a tree holding only a root node with the given payload.
    pub fn new(root_payload: T) -> Self {
        Tree {
            nodes: vec![Some(TreeNode {
                index: 0,
                parent: None,
                children: Vec::new(),
                payload: root_payload,
            })],
            root: 0,
            node_count: 1,
            view: ViewState::default(),
        }
    }

    /// Index of the root node.
    pub fn root_index(&self) -> usize {
        self.root
    }

    /// Number of nodes visible in the current view.
    pub fn len(&self) -> usize {
        if self.view.active {
            self.iter_pre_order().count()
        } else {
            self.node_count
        }
    }

    /// Whether the tree holds no nodes besides the root.
    pub fn is_empty(&self) -> bool {
        self.node_count <= 1
    }

    /// Look up a node by index, failing with [`TreeError::NodeNotFound`].
    pub fn find(&self, index: usize) -> Result<&TreeNode<T>> {
        self.nodes
            .get(index)
            .and_then(|slot| slot.as_ref())
            .ok_or(TreeError::NodeNotFound { index })
    }

    /// Mutable lookup by index.
    pub fn find_mut(&mut self, index: usize) -> Result<&mut TreeNode<T>> {
        self.nodes
            .get_mut(index)
            .and_then(|slot| slot.as_mut())
            .ok_or(TreeError::NodeNotFound { index })
    }

    /// Payload of a node.
    pub fn payload(&self, index: usize) -> Result<&T> {
        Ok(&self.find(index)?.payload)
    }

    /// Mutable payload of a node.
    pub fn payload_mut(&mut self, index: usize) -> Result<&mut T> {
        Ok(&mut self.find_mut(index)?.payload)
    }

    /// Whether `index` refers to a live node.
    pub fn contains(&self, index: usize) -> bool {
        self.nodes.get(index).is_some_and(|slot| slot.is_some())
    }

    /// Parent of a node in the current view.
    pub fn parent_of(&self, index: usize) -> Result<Option<usize>> {
        if self.view.active {
            self.view
                .view_parent
                .get(&index)
                .copied()
                .ok_or(TreeError::NodeNotFound { index })
        } else {
            Ok(self.find(index)?.parent)
        }
    }

    /// Children of a node in the current view.
    pub fn children_of(&self, index: usize) -> Result<Vec<usize>> {
        if self.view.active {
            match self.view.view_children.get(&index) {
                Some(children) => Ok(children.clone()),
                None => Err(TreeError::NodeNotFound { index }),
            }
        } else {
            Ok(self.find(index)?.children.clone())
        }
    }

    /// Whether the node has no children in the current view.
    pub fn is_leaf(&self, index: usize) -> Result<bool> {
        Ok(self.children_of(index)?.is_empty())
    }

    /// Whether the node is the root.
    pub fn is_root(&self, index: usize) -> bool {
        index == self.root
    }

    /// Insert a new node under `parent`, returning the new node's index.
    ///
    /// Structural mutation is rejected while a computational view is active.
    pub fn insert(&mut self, parent: usize, payload: T) -> Result<usize> {
        self.reject_mutation_in_view()?;
        self.find(parent)?;
        let index = self.nodes.len();
        self.nodes.push(Some(TreeNode {
            index,
            parent: Some(parent),
            children: Vec::new(),
            payload,
        }));
        if let Some(Some(parent_node)) = self.nodes.get_mut(parent) {
            parent_node.children.push(index);
        }
        self.node_count += 1;
        self.view.clear();
        Ok(index)
    }

    /// Remove a node, reattaching its children to its parent in place.
    ///
    /// Removing the root fails with [`TreeError::InvalidOperation`]; use
    /// [`Tree::remove_root_with_replacement`] when the root has a designated
    /// successor.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        self.reject_mutation_in_view()?;
        if index == self.root {
            return Err(TreeError::InvalidOperation(
                "cannot remove the root without a designated replacement".into(),
            ));
        }
        let node = self
            .nodes
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(TreeError::NodeNotFound { index })?;
        let parent = node
            .parent
            .expect("non-root node always has a parent");
        for &child in &node.children {
            if let Some(Some(child_node)) = self.nodes.get_mut(child) {
                child_node.parent = Some(parent);
            }
        }
        if let Some(Some(parent_node)) = self.nodes.get_mut(parent) {
            let pos = parent_node
                .children
                .iter()
                .position(|&c| c == index)
                .expect("parent lists removed node as child");
            parent_node.children.splice(pos..=pos, node.children.iter().copied());
        }
        self.node_count -= 1;
        self.view.clear();
        Ok(node.payload)
    }

    /// Remove the root, promoting its sole child to be the new root.
    pub fn remove_root_with_replacement(&mut self) -> Result<T> {
        self.reject_mutation_in_view()?;
        let root_children = self.find(self.root)?.children.clone();
        if root_children.len() != 1 {
            return Err(TreeError::InvalidOperation(format!(
                "root removal needs exactly one replacement child, found {}",
                root_children.len()
            )));
        }
        let old_root = self.root;
        let new_root = root_children[0];
        let node = self.nodes[old_root].take().expect("root slot is live");
        if let Some(Some(child)) = self.nodes.get_mut(new_root) {
            child.parent = None;
        }
        self.root = new_root;
        self.node_count -= 1;
        self.view.clear();
        Ok(node.payload)
    }

    fn reject_mutation_in_view(&self) -> Result<()> {
        if self.view.active {
            Err(TreeError::InvalidOperation(
                "structural mutation is not allowed while a computational view is active".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Deep-copy the topology into a new tree, mapping each payload.
    ///
    /// Node indices, ordering and parent/child links are recreated from
    /// scratch in the new storage; the view overlay is not carried over. This
    /// is the canonical way to derive one tree kind from another.
    pub fn map_payload<U>(&self, mut f: impl FnMut(usize, &T) -> U) -> Tree<U> {
        let nodes = self
            .nodes
            .iter()
            .map(|slot| {
                slot.as_ref().map(|n| TreeNode {
                    index: n.index,
                    parent: n.parent,
                    children: n.children.clone(),
                    payload: f(n.index, &n.payload),
                })
            })
            .collect();
        Tree {
            nodes,
            root: self.root,
            node_count: self.node_count,
            view: ViewState::default(),
        }
    }

    /// Whether two trees share the same live indices, root and links.
    pub fn topology_eq<U>(&self, other: &Tree<U>) -> bool {
        if self.root != other.root || self.node_count != other.node_count {
            return false;
        }
        let max_len = self.nodes.len().max(other.nodes.len());
        for index in 0..max_len {
            let a = self.nodes.get(index).and_then(|s| s.as_ref());
            let b = other.nodes.get(index).and_then(|s| s.as_ref());
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    if a.parent != b.parent || a.children != b.children {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Depth-first pre-order traversal from the root (view-aware).
    pub fn iter_pre_order(&self) -> PreOrderIter<'_, T> {
        PreOrderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Depth-first post-order traversal from the root (view-aware).
    pub fn iter_post_order(&self) -> PostOrderIter<'_, T> {
        PostOrderIter {
            tree: self,
            stack: vec![(self.root, 0)],
        }
    }

    /// Breadth-first traversal from the root (view-aware).
    pub fn iter_breadth_first(&self) -> BreadthFirstIter<'_, T> {
        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        BreadthFirstIter { tree: self, queue }
    }

    /// Indices of all leaves in the current view, in pre-order.
    pub fn leaves(&self) -> Vec<usize> {
        self.iter_pre_order()
            .filter(|n| {
                self.children_of(n.index())
                    .map(|c| c.is_empty())
                    .unwrap_or(false)
            })
            .map(TreeNode::index)
            .collect()
    }

    /// Path from a node up to the root, inclusive at both ends (view-aware).
    pub fn path_to_root(&self, index: usize) -> Result<Vec<usize>> {
        let mut path = vec![index];
        let mut current = index;
        while let Some(parent) = self.parent_of(current)? {
            path.push(parent);
            current = parent;
        }
        Ok(path)
    }

    /// Lowest common ancestor of two nodes (view-aware).
    pub fn lowest_common_ancestor(&self, a: usize, b: usize) -> Result<usize> {
        let path_a = self.path_to_root(a)?;
        let path_b = self.path_to_root(b)?;
        let set_a: ahash::AHashSet<usize> = path_a.iter().copied().collect();
        path_b
            .into_iter()
            .find(|idx| set_a.contains(idx))
            .ok_or_else(|| TreeError::InvalidOperation("nodes share no ancestor".into()))
    }

    /// Path from `a` to `b` through their lowest common ancestor, inclusive.
    pub fn path_between(&self, a: usize, b: usize) -> Result<Vec<usize>> {
        let lca = self.lowest_common_ancestor(a, b)?;
        let mut up = Vec::new();
        let mut current = a;
        while current != lca {
            up.push(current);
            current = self
                .parent_of(current)?
                .expect("walk towards an ancestor cannot pass the root");
        }
        up.push(lca);
        let mut down = Vec::new();
        current = b;
        while current != lca {
            down.push(current);
            current = self
                .parent_of(current)?
                .expect("walk towards an ancestor cannot pass the root");
        }
        up.extend(down.into_iter().rev());
        Ok(up)
    }

    /// Number of nodes in the subtree rooted at `index` (view-aware,
    /// including `index` itself).
    pub fn subtree_size(&self, index: usize) -> Result<usize> {
        self.find(index)?;
        let mut count = 0;
        let mut stack = vec![index];
        while let Some(idx) = stack.pop() {
            count += 1;
            stack.extend(self.children_of(idx)?);
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Computational view
    // ------------------------------------------------------------------

    /// Mark the nodes visible in the computational view.
    ///
    /// The root is always included. Each marked node's view parent is its
    /// nearest marked ancestor; payloads are untouched.
    pub fn set_view_marks(&mut self, marked: &[usize]) -> Result<()> {
        if self.view.active {
            return Err(TreeError::InvalidOperation(
                "cannot change view marks while the view is active".into(),
            ));
        }
        self.view.clear();
        let mut flags = vec![false; self.nodes.len()];
        flags[self.root] = true;
        for &index in marked {
            self.find(index)?;
            flags[index] = true;
        }
        let mut view_parent = AHashMap::new();
        let mut view_children: AHashMap<usize, Vec<usize>> = AHashMap::new();
        for slot in self.nodes.iter().flatten() {
            if !flags[slot.index] {
                continue;
            }
            view_children.entry(slot.index).or_default();
            let mut ancestor = slot.parent;
            while let Some(idx) = ancestor {
                if flags[idx] {
                    break;
                }
                ancestor = self.nodes[idx].as_ref().and_then(|n| n.parent);
            }
            view_parent.insert(slot.index, ancestor);
            if let Some(parent) = ancestor {
                view_children.entry(parent).or_default().push(slot.index);
            }
        }
        // Keep child ordering deterministic (pre-order of the fine tree).
        let order: AHashMap<usize, usize> = self
            .iter_pre_order()
            .enumerate()
            .map(|(pos, node)| (node.index(), pos))
            .collect();
        for children in view_children.values_mut() {
            children.sort_by_key(|idx| order[idx]);
        }
        self.view.marked = flags;
        self.view.view_parent = view_parent;
        self.view.view_children = view_children;
        Ok(())
    }

    /// Forget the computational view marks.
    pub fn clear_view_marks(&mut self) {
        self.view.clear();
    }

    /// Whether computational view marks have been set.
    pub fn has_view_marks(&self) -> bool {
        self.view.has_marks()
    }

    /// Whether the computational view is currently active.
    pub fn view_active(&self) -> bool {
        self.view.active
    }

    /// Whether a node is marked as part of the computational view.
    pub fn is_view_marked(&self, index: usize) -> bool {
        self.view.marked.get(index).copied().unwrap_or(false)
    }

    /// Run `f` with the computational view active.
    ///
    /// The fine-grained view is restored when `f` returns *and* when it
    /// panics; marks must have been set beforehand.
    pub fn with_computational_view<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R> {
        if !self.view.has_marks() {
            return Err(TreeError::InvalidOperation(
                "no computational view marks set".into(),
            ));
        }
        self.view.active = true;
        struct Restore<'a, T>(&'a mut Tree<T>);
        impl<T> Drop for Restore<'_, T> {
            fn drop(&mut self) {
                self.0.view.active = false;
            }
        }
        let mut restore = Restore(self);
        Ok(f(&mut *restore.0))
    }

    /// RAII variant of [`Tree::with_computational_view`]: the view stays
    /// active for the guard's lifetime and deactivates on drop.
    pub fn computational_scope(&mut self) -> Result<ComputationalScope<'_, T>> {
        if !self.view.has_marks() {
            return Err(TreeError::InvalidOperation(
                "no computational view marks set".into(),
            ));
        }
        self.view.active = true;
        Ok(ComputationalScope { tree: self })
    }
}

/// Scope guard returned by [`Tree::computational_scope`].
///
/// Dereferences to the tree; dropping it restores the fine-grained view.
pub struct ComputationalScope<'a, T> {
    tree: &'a mut Tree<T>,
}

impl<T> Deref for ComputationalScope<'_, T> {
    type Target = Tree<T>;

    fn deref(&self) -> &Tree<T> {
        self.tree
    }
}

impl<T> DerefMut for ComputationalScope<'_, T> {
    fn deref_mut(&mut self) -> &mut Tree<T> {
        self.tree
    }
}

impl<T> Drop for ComputationalScope<'_, T> {
    fn drop(&mut self) {
        self.tree.view.active = false;
    }
}

/// Pre-order traversal iterator. Restartable: create a fresh one any time.
pub struct PreOrderIter<'a, T> {
    tree: &'a Tree<T>,
    stack: Vec<usize>,
}

impl<'a, T> Iterator for PreOrderIter<'a, T> {
    type Item = &'a TreeNode<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        let children = self.tree.children_of(index).ok()?;
        self.stack.extend(children.into_iter().rev());
        self.tree.find(index).ok()
    }
}

/// Post-order traversal iterator.
pub struct PostOrderIter<'a, T> {
    tree: &'a Tree<T>,
    stack: Vec<(usize, usize)>,
}

impl<'a, T> Iterator for PostOrderIter<'a, T> {
    type Item = &'a TreeNode<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, cursor) = *self.stack.last()?;
            let children = self.tree.children_of(index).ok()?;
            if cursor < children.len() {
                self.stack.last_mut()?.1 += 1;
                self.stack.push((children[cursor], 0));
            } else {
                self.stack.pop();
                return self.tree.find(index).ok();
            }
        }
    }
}

/// Breadth-first traversal iterator.
pub struct BreadthFirstIter<'a, T> {
    tree: &'a Tree<T>,
    queue: VecDeque<usize>,
}

impl<'a, T> Iterator for BreadthFirstIter<'a, T> {
    type Item = &'a TreeNode<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.queue.pop_front()?;
        self.queue.extend(self.tree.children_of(index).ok()?);
        self.tree.find(index).ok()
    }
}
