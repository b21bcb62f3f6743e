// Copyright 2025 Cabletree Developers
// SPDX-License-Identifier: Apache-2.0

//! Explicit channel registry.
//!
//! The registry is an owned object passed to trees, solvers and fitters at
//! construction; its lifecycle is tied to the computation session. There is
//! no process-wide channel state.

use std::sync::Arc;

use ahash::AHashMap;

use crate::channel::IonChannel;
use crate::ChannelError;

/// Shared, read-only collection of ion-channel models keyed by name.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: AHashMap<String, Arc<dyn IonChannel>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.names())
            .finish()
    }
}

impl ChannelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under its own name. Re-registering the same name
    /// replaces the stored model.
    pub fn register(&mut self, channel: Arc<dyn IonChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn IonChannel>> {
        self.channels.get(name)
    }

    /// Look up a channel by name, failing with a structured error.
    pub fn require(&self, name: &str) -> Result<&Arc<dyn IonChannel>, ChannelError> {
        self.channels
            .get(name)
            .ok_or_else(|| ChannelError::Unknown(name.to_string()))
    }

    /// Registered channel names, sorted for deterministic output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
