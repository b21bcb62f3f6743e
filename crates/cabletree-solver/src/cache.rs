// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Digest-keyed cache for expensive kernel computations.
//!
//! Keys are derived from a canonical structural+parameter encoding of the
//! tree (sorted channel maps, fixed field order) so that any value
//! difference anywhere in the tree changes the digest. Entries are never
//! evicted: trees are effectively immutable once a computation pass starts,
//! and a changed tree simply produces a new digest.
//!
//! Lookups and inserts are guarded by a read-write lock; concurrent
//! computations for the same key are idempotent (recompute-and-overwrite),
//! since every value is a pure function of its key. Entries can optionally
//! be persisted to a directory keyed by the digest string; a load miss or
//! I/O failure falls back to recomputation.

use std::path::PathBuf;

use ahash::AHashMap;
use nalgebra::DMatrix;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use cabletree_structures::{MembranePayload, Tree};

use crate::kernel::{C64, ExpKernel};
use crate::quadrature::SampledKernel;
use crate::sov::ModeExpansion;

/// Canonical per-node encoding used for digests.
#[derive(Serialize)]
struct CanonicalNode {
    index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    xyz: [f64; 3],
    radius: f64,
    c_m: f64,
    r_a: f64,
    g_shunt: f64,
    v_ep: f64,
    currents: Vec<(String, f64, f64)>,
}

/// Digest of a physiological tree's full structural and parametric state.
pub fn tree_digest<T: MembranePayload>(tree: &Tree<T>) -> String {
    let nodes: Vec<CanonicalNode> = tree
        .iter_pre_order()
        .map(|node| {
            let geometry = node.payload.geometry();
            let membrane = node.payload.membrane();
            let mut currents: Vec<(String, f64, f64)> = membrane
                .currents
                .iter()
                .map(|(name, density)| (name.clone(), density.g, density.e))
                .collect();
            currents.sort_by(|a, b| a.0.cmp(&b.0));
            CanonicalNode {
                index: node.index(),
                parent: node.parent(),
                children: node.children().to_vec(),
                xyz: geometry.xyz,
                radius: geometry.radius,
                c_m: membrane.c_m,
                r_a: membrane.r_a,
                g_shunt: membrane.g_shunt,
                v_ep: membrane.v_ep,
                currents,
            }
        })
        .collect();
    let encoded = serde_json::to_vec(&nodes).expect("canonical encoding is serializable");
    blake3::hash(&encoded).to_hex().to_string()
}

/// A cached solver product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheValue {
    /// Impedance matrices, one per frequency.
    Matrices(Vec<DMatrix<C64>>),
    /// A sum-of-exponentials kernel.
    Kernel(ExpKernel),
    /// A sampled time-domain kernel.
    Sampled(SampledKernel),
    /// A full eigenmode expansion.
    Expansion(ModeExpansion),
}

/// Memoization layer in front of the kernel solvers.
#[derive(Debug, Default)]
pub struct KernelCache {
    entries: RwLock<AHashMap<String, CacheValue>>,
    persist_dir: Option<PathBuf>,
}

impl KernelCache {
    /// In-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that additionally persists entries as `<digest>.json` files.
    pub fn with_persistence(dir: PathBuf) -> Self {
        KernelCache {
            entries: RwLock::new(AHashMap::new()),
            persist_dir: Some(dir),
        }
    }

    /// Compose a cache key from a tree digest, an operation tag and a
    /// parameter representation.
    pub fn compose_key(parts: &[&str]) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(&[0x1f]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the in-memory store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Look up a key, falling back to the persistence directory.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        if let Some(value) = self.entries.read().get(key) {
            trace!(key, "cache hit (memory)");
            return Some(value.clone());
        }
        let dir = self.persist_dir.as_ref()?;
        let path = dir.join(format!("{key}.json"));
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheValue>(&bytes) {
            Ok(value) => {
                trace!(key, "cache hit (disk)");
                self.entries.write().insert(key.to_string(), value.clone());
                Some(value)
            }
            Err(error) => {
                warn!(key, %error, "discarding unreadable cache file");
                None
            }
        }
    }

    /// Store a value under a key, overwriting any concurrent insert (values
    /// are pure functions of the key, so last-write-wins is safe).
    pub fn insert(&self, key: &str, value: CacheValue) {
        if let Some(dir) = &self.persist_dir {
            if let Err(error) = std::fs::create_dir_all(dir)
                .and_then(|_| {
                    let encoded = serde_json::to_vec(&value)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    std::fs::write(dir.join(format!("{key}.json")), encoded)
                })
            {
                warn!(key, %error, "failed to persist cache entry");
            }
        }
        self.entries.write().insert(key.to_string(), value);
    }

    /// Memoized computation: return the cached value or run `compute` and
    /// store its result.
    pub fn get_or_compute<E>(
        &self,
        key: &str,
        compute: impl FnOnce() -> std::result::Result<CacheValue, E>,
    ) -> std::result::Result<CacheValue, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }
}
