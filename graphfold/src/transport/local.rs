/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local (in-process) transport implementation.
//!
//! Every "process" of the cluster is a handle onto shared in-memory
//! channels. Values still cross the boundary bincode-encoded, so the
//! local transport exercises the same serialization paths as a networked
//! one. This is the substrate of the end-to-end tests and of
//! single-machine runs.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Barrier;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::Message;
use super::Transport;
use crate::data::Serialized;

type Data = Vec<u8>;

/// Create a new local cluster, returning one transport per process.
pub fn new(world_size: usize) -> Vec<LocalTransport> {
    assert!(world_size > 0, "a cluster has at least one process");
    let mut collective_txs = Vec::with_capacity(world_size);
    let mut collective_rxs = Vec::with_capacity(world_size);
    let mut message_txs = Vec::with_capacity(world_size);
    let mut message_rxs = Vec::with_capacity(world_size);
    for _ in 0..world_size {
        let (tx, rx) = mpsc::unbounded_channel::<Data>();
        collective_txs.push(tx);
        collective_rxs.push(rx);
        let (tx, rx) = mpsc::unbounded_channel::<Data>();
        message_txs.push(tx);
        message_rxs.push(rx);
    }
    let shared = Arc::new(Shared {
        barrier: Barrier::new(world_size),
        collective_txs,
        message_txs,
    });
    collective_rxs
        .into_iter()
        .zip(message_rxs)
        .enumerate()
        .map(|(rank, (collective_rx, message_rx))| LocalTransport {
            rank,
            shared: Arc::clone(&shared),
            seq: AtomicU64::new(0),
            lane: Mutex::new(CollectiveLane {
                rx: collective_rx,
                pending: Vec::new(),
            }),
            message_rx: Mutex::new(message_rx),
        })
        .collect()
}

struct Shared {
    barrier: Barrier,
    collective_txs: Vec<mpsc::UnboundedSender<Data>>,
    message_txs: Vec<mpsc::UnboundedSender<Data>>,
}

/// Incoming collective traffic for one rank.
///
/// Collectives are matched by sequence number: every rank numbers the
/// collectives it participates in, and since all ranks invoke them in the
/// same order, a payload's sequence identifies which collective it belongs
/// to. A fast peer's contribution to a later collective is held back in
/// `pending` until this rank catches up.
struct CollectiveLane {
    rx: mpsc::UnboundedReceiver<Data>,
    pending: Vec<Payload>,
}

type Payload = (u64, usize, Serialized);

/// One process's handle onto a local cluster.
pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
    seq: AtomicU64,
    lane: Mutex<CollectiveLane>,
    message_rx: Mutex<mpsc::UnboundedReceiver<Data>>,
}

impl LocalTransport {
    fn post_collective(&self, target: usize, payload: Payload) {
        let data = bincode::serialize(&payload).expect("collective payload serialization");
        self.shared.collective_txs[target]
            .send(data)
            .expect("collective channel closed");
    }

    async fn recv_collective(&self, lane: &mut CollectiveLane, seq: u64) -> (usize, Serialized) {
        if let Some(at) = lane.pending.iter().position(|(s, _, _)| *s == seq) {
            let (_, from, value) = lane.pending.swap_remove(at);
            return (from, value);
        }
        loop {
            let data = lane.rx.recv().await.expect("collective channel closed");
            let (s, from, value): Payload =
                bincode::deserialize(&data).expect("malformed collective payload");
            if s == seq {
                return (from, value);
            }
            lane.pending.push((s, from, value));
        }
    }

    /// Receive the next fire-and-forget message addressed to this
    /// process, or `None` once all peers are gone.
    pub async fn recv_message(&self) -> Option<Message> {
        let data = self.message_rx.lock().await.recv().await?;
        Some(bincode::deserialize(&data).expect("malformed message"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.collective_txs.len()
    }

    async fn barrier(&self) {
        self.shared.barrier.wait().await;
    }

    async fn gather(&self, value: Serialized, root: usize) -> Option<Vec<Serialized>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if self.rank == root {
            let world_size = self.world_size();
            let mut slots: Vec<Option<Serialized>> = vec![None; world_size];
            slots[root] = Some(value);
            let mut lane = self.lane.lock().await;
            for _ in 0..world_size - 1 {
                let (from, contribution) = self.recv_collective(&mut lane, seq).await;
                let previous = slots[from].replace(contribution);
                assert!(previous.is_none(), "duplicate gather contribution from {from}");
            }
            Some(slots.into_iter().map(|slot| slot.expect("gather slot")).collect())
        } else {
            self.post_collective(root, (seq, self.rank, value));
            None
        }
    }

    async fn broadcast(&self, value: Option<Serialized>) -> Serialized {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match value {
            Some(value) => {
                for target in 0..self.world_size() {
                    if target != self.rank {
                        self.post_collective(target, (seq, self.rank, value.clone()));
                    }
                }
                value
            }
            None => {
                let mut lane = self.lane.lock().await;
                let (_, value) = self.recv_collective(&mut lane, seq).await;
                value
            }
        }
    }

    fn send(&self, target: usize, message: Message) {
        let data = match bincode::serialize(&message) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(target, %err, "failed to serialize message");
                return;
            }
        };
        if self.shared.message_txs[target].send(data).is_err() {
            tracing::warn!(target, "message channel closed");
        }
    }
}
