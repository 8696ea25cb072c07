/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cluster transport interface.
//!
//! The aggregator runs over a fixed set of peer processes, reached through
//! two kinds of primitives: collectives (barrier, gather, broadcast) used
//! by the synchronous executor, and fire-and-forget typed messages used by
//! the asynchronous completion protocol. Messages carry their own key and
//! are dispatched by the receiving engine to
//! [`Aggregator::handle_message`](crate::Aggregator::handle_message);
//! there are no remote procedure stubs and no return values.
//!
//! Delivery failure is not part of the interface: the cluster is assumed
//! fixed for the lifetime of a run, and a transport that cannot deliver
//! has no recovery path here.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::data::Serialized;

pub mod local;

/// A fire-and-forget message of the asynchronous completion protocol.
///
/// Ordering is not required, not even per sender-receiver pair: each
/// message names its key, and the countdown accounting tolerates any
/// interleaving of messages for distinct keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// A process finished its local reduction for `key`; fold `snapshot`
    /// into the leader's accumulator. Sent to the leader.
    MergeValue {
        /// Aggregation key.
        key: String,
        /// The sender's reduced local state.
        snapshot: Serialized,
    },
    /// The cluster-wide value for `key` is complete; load it, run
    /// finalize, and acknowledge. Sent by the leader to every other
    /// process.
    Finalize {
        /// Aggregation key.
        key: String,
        /// The globally reduced state.
        snapshot: Serialized,
    },
    /// A process finished finalizing `key`. Sent to the leader.
    FinalizeDone {
        /// Aggregation key.
        key: String,
    },
    /// Schedule the next round of `key`. Sent by the leader to every
    /// other process once all finalizations are acknowledged.
    ScheduleKey {
        /// Aggregation key.
        key: String,
        /// Next fire-time, as an offset from the run's start time.
        fire_at: Duration,
    },
}

/// A fixed cluster of peer processes.
///
/// Collectives must be invoked by every process in the same order;
/// `gather` and `broadcast` block until the whole cluster participates.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This process's id, in `0..world_size()`.
    fn rank(&self) -> usize;

    /// The fixed number of peer processes.
    fn world_size(&self) -> usize;

    /// Block until every process has entered the barrier.
    async fn barrier(&self);

    /// Collect one value from every process at `root`.
    ///
    /// Returns, on the root only, a vector whose i-th slot is process
    /// i's contribution; all other processes return `None`.
    async fn gather(&self, value: Serialized, root: usize) -> Option<Vec<Serialized>>;

    /// Propagate one value from the sender to every process.
    ///
    /// Exactly one process passes `Some`; every process (the sender
    /// included) returns that value.
    async fn broadcast(&self, value: Option<Serialized>) -> Serialized;

    /// Send a fire-and-forget message to `target`.
    fn send(&self, target: usize, message: Message);
}
