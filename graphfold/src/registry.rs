/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The registry of named reductions.
//!
//! Keys are registered once and never removed; the mapping is effectively
//! immutable while the engine runs. Registration is process-local: callers
//! are expected to register the same keys with the same reduction types on
//! every process before starting. The registry does not verify this; a
//! divergence surfaces later as a typehash mismatch when a snapshot is
//! loaded.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::accum::ErasedMapReduce;
use crate::graph::Graph;

/// Key to reduction specification (and its process-level accumulator).
pub(crate) struct Registry<C, G: Graph> {
    entries: DashMap<String, Arc<dyn ErasedMapReduce<C, G>>>,
}

impl<C, G: Graph> Registry<C, G> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a reduction under `key`. Fails (returning false) when the
    /// key is empty or already present.
    pub(crate) fn insert(
        &self,
        key: &str,
        reduction: Arc<dyn ErasedMapReduce<C, G>>,
    ) -> bool {
        if key.is_empty() {
            return false;
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(reduction);
                true
            }
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<dyn ErasedMapReduce<C, G>>> {
        self.entries.get(key).map(|entry| Arc::clone(&*entry))
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Reset every registered accumulator to empty. The specifications
    /// themselves persist for reuse on a future run.
    pub(crate) fn clear_accumulators(&self) {
        for entry in self.entries.iter() {
            entry.value().clear();
        }
    }
}
