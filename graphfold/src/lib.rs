/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]

//! Graphfold executes named map-reduce computations over partitioned
//! graphs, across a fixed cluster of peer processes, on demand or on a
//! periodic schedule.
//!
//! An aggregation is a triple (map, combine, finalize): the map callback
//! runs over every vertex or every directed edge of the graph, results
//! combine through an associative, commutative operation, and finalize
//! runs once per process with the single cluster-wide value. Reduction is
//! two-level: per-thread accumulators fold into a per-process value, and
//! per-process values fold into a cluster value at the leader, which
//! broadcasts the result back.
//!
//! The crate provides the coordination and scheduling machinery only. The
//! graph, the transport between processes, the callback context, and the
//! threads that drive ticking all belong to the embedding engine and
//! reach the aggregator through the [`graph::Graph`] and
//! [`transport::Transport`] interfaces.
//!
//! ```text
//! engine threads ──map──▶ per-thread accumulators
//!                              │ merge
//!                              ▼
//!                     per-process accumulator
//!                              │ gather (leader)
//!                              ▼
//!                      cluster-wide value ──broadcast──▶ finalize, everywhere
//! ```
//!
//! Two execution disciplines are offered, one of which the engine picks
//! per run: a lock-step synchronous tick driven simultaneously by every
//! process, and an asynchronous tick polled independently by many worker
//! threads per process, with message-based completion accounting. See
//! [`Aggregator`].

mod accum;
pub mod aggregator;
pub mod clock;
pub mod data;
pub mod graph;
mod registry;
mod schedule;
pub mod transport;

pub use aggregator::Aggregator;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::RealClock;
pub use data::Serialized;
pub use graph::Graph;
pub use graph::MemEdge;
pub use graph::MemGraph;
pub use graph::MemVertex;
pub use transport::Message;
pub use transport::Transport;
