/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The trigger schedule: a lock-protected min-queue of pending
//! aggregations ordered by fire-time.
//!
//! Fire-times are offsets from the run's start time. The queue holds at
//! most one entry per key; callers reinsert a key only after its previous
//! round completes. Ties on fire-time break by key so that every process
//! pops entries in the same order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

/// Field order gives the (fire_at, key) ordering via the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    fire_at: Duration,
    key: String,
}

/// A min-queue of `(key, fire-time)` pairs behind a mutex.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
}

impl Schedule {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert `key` to fire at offset `fire_at` from start.
    pub(crate) fn push(&self, key: String, fire_at: Duration) {
        self.heap
            .lock()
            .unwrap()
            .push(Reverse(Entry { fire_at, key }));
    }

    /// Pop the earliest entry if its fire-time has passed.
    ///
    /// The comparison is strict: an entry scheduled exactly at `now` is
    /// not yet due. A key rescheduled at the current time therefore
    /// cannot fire twice against one time reading.
    pub(crate) fn pop_ready(&self, now: Duration) -> Option<String> {
        Self::pop_ready_locked(&mut self.heap.lock().unwrap(), now)
    }

    /// Like [`Self::pop_ready`], but backs off instead of blocking when
    /// the queue is contended.
    pub(crate) fn try_pop_ready(&self, now: Duration) -> Option<String> {
        let mut heap = self.heap.try_lock().ok()?;
        Self::pop_ready_locked(&mut heap, now)
    }

    fn pop_ready_locked(
        heap: &mut BinaryHeap<Reverse<Entry>>,
        now: Duration,
    ) -> Option<String> {
        match heap.peek() {
            Some(Reverse(entry)) if entry.fire_at < now => {
                heap.pop().map(|Reverse(entry)| entry.key)
            }
            _ => None,
        }
    }

    pub(crate) fn clear(&self) {
        self.heap.lock().unwrap().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}
