/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The distributed periodic aggregator.
//!
//! An [`Aggregator`] executes named map-reduce computations over all
//! vertices or all edges of a partitioned graph, across a fixed cluster of
//! peer processes, on demand or on a periodic schedule. One round runs in
//! three stages: engine threads fold their share of the local partition
//! into per-thread accumulators; the per-thread results merge into one
//! per-process value; process values reduce to a single cluster value at
//! the leader (process 0), which every process then finalizes.
//!
//! The embedding engine drives the aggregator. It registers reductions
//! and periods before a run, calls [`Aggregator::start`], and then ticks
//! in one of two modes, never both within one run:
//!
//! - **Synchronous**: exactly one thread on every process calls
//!   [`Aggregator::tick_synchronous`] at the same time. Due keys run
//!   inline, blocking on gather/broadcast collectives.
//! - **Asynchronous**: any thread may poll
//!   [`Aggregator::tick_asynchronous`]; when it yields a key, every one
//!   of the `ncpus` engine threads on that process must call
//!   [`Aggregator::tick_asynchronous_compute`] for it exactly once.
//!   Completion is accounted over fire-and-forget messages in two phases
//!   (merge, then finalize), so that no process can start a key's next
//!   round while another is still reading the previous result.
//!
//! At termination the engine calls [`Aggregator::stop`], which resets all
//! accumulation state; registrations and periods persist for a future run.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use algebra::Semigroup;
use anyhow::Context as _;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::accum::ErasedMapReduce;
use crate::accum::MapReduce;
use crate::clock::Clock;
use crate::clock::RealClock;
use crate::data::Serialized;
use crate::graph::Graph;
use crate::registry::Registry;
use crate::schedule::Schedule;
use crate::transport::Message;
use crate::transport::Transport;

/// The process coordinating gathers, broadcasts, and the asynchronous
/// completion protocol.
const LEADER: usize = 0;

/// Per-key state of the asynchronous executor. Allocated by
/// [`Aggregator::start`] for every periodic key when `ncpus > 0`.
struct AsyncKeyState<C, G: Graph> {
    /// Reduces all local threads. On the leader, also reduces all
    /// processes.
    root: Box<dyn ErasedMapReduce<C, G>>,
    /// One accumulator per engine thread, indexed by cpu id.
    per_thread: Vec<Box<dyn ErasedMapReduce<C, G>>>,
    /// Engine threads yet to finish the current local reduction.
    local_remaining: AtomicUsize,
    /// Leader only. Counts process contributions during the merge phase,
    /// then finalization acknowledgements during the finalize phase.
    cluster_remaining: AtomicUsize,
}

/// A distributed periodic aggregator bound to a transport, a graph
/// partition, and the context handed to user callbacks.
pub struct Aggregator<C, G: Graph, T: Transport> {
    transport: Arc<T>,
    graph: Arc<G>,
    context: Arc<C>,
    clock: Arc<dyn Clock>,
    registry: Registry<C, G>,
    /// Keyed period table. Ordered: collective operations iterate it, and
    /// every process must issue collectives in the same order.
    periods: Mutex<BTreeMap<String, Duration>>,
    schedule: Schedule,
    async_state: DashMap<String, Arc<AsyncKeyState<C, G>>>,
    start_time: Mutex<Duration>,
}

impl<C, G, T> Aggregator<C, G, T>
where
    C: Send + Sync + 'static,
    G: Graph,
    T: Transport,
{
    /// Create an aggregator over the given transport, graph partition,
    /// and callback context, timed by the wall clock.
    pub fn new(transport: Arc<T>, graph: Arc<G>, context: Arc<C>) -> Self {
        Self::with_clock(transport, graph, context, Arc::new(RealClock))
    }

    /// Like [`Self::new`], with an explicit time source.
    pub fn with_clock(
        transport: Arc<T>,
        graph: Arc<G>,
        context: Arc<C>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            graph,
            context,
            clock,
            registry: Registry::new(),
            periods: Mutex::new(BTreeMap::new()),
            schedule: Schedule::new(),
            async_state: DashMap::new(),
            start_time: Mutex::new(Duration::ZERO),
        }
    }

    /// Register a vertex reduction under `key`.
    ///
    /// Each round maps every vertex of the graph exactly once (a vertex
    /// replicated onto several processes contributes only on its owner)
    /// and combines the results; `finalize` then runs once per process
    /// with the combined value. Returns false when the key is empty or
    /// already registered.
    ///
    /// Registration is process-local: callers must register the same keys
    /// with the same reduction types on every process before starting.
    pub fn register_vertex<R, M, F>(&self, key: &str, map: M, finalize: F) -> bool
    where
        R: Semigroup + Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
        M: Fn(&C, &G::Vertex) -> R + Send + Sync + 'static,
        F: Fn(&C, &R) + Send + Sync + 'static,
    {
        self.registry
            .insert(key, Arc::new(MapReduce::vertex(map, finalize)))
    }

    /// Register an edge reduction under `key`.
    ///
    /// Each round maps every directed edge of the graph exactly once:
    /// edges are visited as in-edges of local vertices, which covers each
    /// edge once provided the partitioner places an edge on the process
    /// holding its target. Otherwise as [`Self::register_vertex`].
    pub fn register_edge<R, M, F>(&self, key: &str, map: M, finalize: F) -> bool
    where
        R: Semigroup + Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
        M: Fn(&C, &G::Edge) -> R + Send + Sync + 'static,
        F: Fn(&C, &R) + Send + Sync + 'static,
    {
        self.registry
            .insert(key, Arc::new(MapReduce::edge(map, finalize)))
    }

    /// Run one round of `key` immediately. Every process must call this
    /// simultaneously with the same key.
    ///
    /// # Panics
    ///
    /// Panics if `key` was never registered, or if a peer process
    /// registered a different reduction type under it.
    pub async fn aggregate_now(&self, key: &str) -> bool {
        let Some(mr) = self.registry.get(key) else {
            panic!("aggregator {key:?} not found");
        };
        mr.clear();
        self.local_reduce(mr.as_ref());
        let local = mr
            .snapshot()
            .unwrap_or_else(|err| panic!("snapshot of {key:?} failed: {err:#}"));
        match self.transport.gather(local, LEADER).await {
            Some(contributions) => {
                for (from, contribution) in contributions.iter().enumerate() {
                    if from == self.transport.rank() {
                        continue;
                    }
                    mr.merge_serialized(contribution).unwrap_or_else(|err| {
                        panic!("merging contribution for {key:?} from process {from}: {err:#}")
                    });
                }
                let total = mr
                    .snapshot()
                    .unwrap_or_else(|err| panic!("snapshot of {key:?} failed: {err:#}"));
                self.transport.broadcast(Some(total)).await;
            }
            None => {
                let total = self.transport.broadcast(None).await;
                mr.load_serialized(&total).unwrap_or_else(|err| {
                    panic!("loading cluster value for {key:?}: {err:#}")
                });
            }
        }
        mr.finalize(&self.context);
        mr.clear();
        true
    }

    /// Request that `key` be aggregated every `seconds` seconds while the
    /// engine runs. Every process must call this simultaneously.
    ///
    /// The period is prescriptive: observed intervals are at least
    /// `seconds`, usually longer. A period of zero means "every tick"
    /// under the synchronous executor. Returns false when `seconds` is
    /// negative (or not a valid duration) or the key is not registered.
    ///
    /// Scheduling takes effect at the next [`Self::start`]; a period set
    /// while running does not insert the key into the live schedule.
    pub async fn aggregate_periodic(&self, key: &str, seconds: f64) -> bool {
        self.transport.barrier().await;
        let Ok(period) = Duration::try_from_secs_f64(seconds) else {
            return false;
        };
        if !self.registry.contains(key) {
            return false;
        }
        self.periods.lock().unwrap().insert(key.to_string(), period);
        true
    }

    /// Run one round of every periodic key, in key order. Used on engine
    /// start so every periodic aggregator has an observable value before
    /// vertex program execution begins. Collective.
    pub async fn aggregate_all_periodic(&self) {
        let keys: Vec<String> = self.periods.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.aggregate_now(&key).await;
        }
    }

    /// The set of keys with a registered period.
    pub fn list_periodic_keys(&self) -> BTreeSet<String> {
        self.periods.lock().unwrap().keys().cloned().collect()
    }

    /// Prepare the schedule for a run. Every process must call this
    /// simultaneously.
    ///
    /// Each periodic key is scheduled to fire one period after now; a
    /// zero period is due immediately. `ncpus` is the number of engine
    /// threads and matters only to the asynchronous executor: when
    /// nonzero, per-key asynchronous state is allocated and sized to it.
    pub async fn start(&self, ncpus: usize) {
        self.transport.barrier().await;
        self.schedule.clear();
        *self.start_time.lock().unwrap() = self.clock.now();
        self.async_state.clear();
        let periods: Vec<(String, Duration)> = self
            .periods
            .lock()
            .unwrap()
            .iter()
            .map(|(key, period)| (key.clone(), *period))
            .collect();
        for (key, period) in &periods {
            self.schedule.push(key.clone(), *period);
        }
        if ncpus > 0 {
            let world_size = self.transport.world_size();
            for (key, _) in periods {
                let spec = self
                    .registry
                    .get(&key)
                    .unwrap_or_else(|| panic!("periodic key {key:?} is not registered"));
                let per_thread = (0..ncpus).map(|_| spec.clone_empty()).collect();
                self.async_state.insert(
                    key,
                    Arc::new(AsyncKeyState {
                        root: spec.clone_empty(),
                        per_thread,
                        local_remaining: AtomicUsize::new(ncpus),
                        cluster_remaining: AtomicUsize::new(world_size),
                    }),
                );
            }
        }
    }

    /// Reset all accumulation state at the end of a run: the schedule,
    /// every registered accumulator, and all asynchronous state.
    /// Registrations and periods persist for reuse by a future
    /// [`Self::start`].
    ///
    /// Cooperative: the engine must have quiesced the ticks first. A
    /// round in progress when `stop` is called is undefined.
    pub fn stop(&self) {
        self.schedule.clear();
        self.registry.clear_accumulators();
        self.async_state.clear();
    }

    /// Run every due key. To be called simultaneously by exactly one
    /// thread on each process under the synchronous mode of execution.
    ///
    /// The leader reads the clock once and broadcasts it, so all
    /// processes agree on what is due; each reschedule inside the loop is
    /// likewise broadcast, keeping the schedules identical. Because the
    /// time reading is taken once per tick, a key rescheduled within the
    /// loop cannot fire twice in one tick, even at period zero.
    pub async fn tick_synchronous(&self) {
        let start_time = *self.start_time.lock().unwrap();
        let leader = self.transport.rank() == LEADER;
        let now = self.clock.now().saturating_sub(start_time);
        let curtime = self.broadcast_time(leader.then_some(now)).await;
        while let Some(key) = self.schedule.pop_ready(curtime) {
            self.aggregate_now(&key).await;
            let next = self.clock.now().saturating_sub(start_time) + self.period(&key);
            let next = self.broadcast_time(leader.then_some(next)).await;
            self.schedule.push(key, next);
        }
    }

    /// Poll for a due key under the asynchronous mode of execution.
    ///
    /// Cheap and non-blocking: backs off immediately when the schedule is
    /// contended. At most one call per process observes a given
    /// activation. When a key is returned, the engine must arrange for
    /// every one of its `ncpus` threads to eventually call
    /// [`Self::tick_asynchronous_compute`] with it exactly once.
    pub fn tick_asynchronous(&self) -> Option<String> {
        let start_time = *self.start_time.lock().unwrap();
        let curtime = self.clock.now().saturating_sub(start_time);
        self.schedule.try_pop_ready(curtime)
    }

    /// Perform engine thread `cpu_id`'s share of the reduction for an
    /// activated key, and hand the result to the completion protocol.
    ///
    /// The thread folds vertices (or the in-edges of vertices) taken at
    /// stride `ncpus` from offset `cpu_id`, merges its accumulator into
    /// the process value, and decrements the local countdown. The thread
    /// that brings it to zero resets the per-thread state and either
    /// accounts the process's completion directly (on the leader) or
    /// ships the process value to the leader.
    ///
    /// # Panics
    ///
    /// Panics if `key` has no asynchronous state (not periodic, or
    /// started with `ncpus = 0`) or `cpu_id` is out of range.
    pub fn tick_asynchronous_compute(&self, cpu_id: usize, key: &str) {
        let state = self.async_key_state(key);
        let ncpus = state.per_thread.len();
        assert!(
            cpu_id < ncpus,
            "cpu {cpu_id} out of range: {ncpus} engine threads"
        );
        let local = state.per_thread[cpu_id].as_ref();
        self.partial_reduce(local, cpu_id, ncpus);
        state.root.merge(local);

        let remaining = state.local_remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(remaining > 0, "local countdown for {key:?} underflowed");
        if remaining > 1 {
            return;
        }

        // Last thread: the root holds every thread's contribution.
        // Restore the per-thread state for the next round.
        for local in &state.per_thread {
            local.clear();
        }
        state.local_remaining.store(ncpus, Ordering::Release);

        if self.transport.rank() == LEADER {
            self.account_merged(&state, key);
        } else {
            let snapshot = state
                .root
                .snapshot()
                .unwrap_or_else(|err| panic!("snapshot of {key:?} failed: {err:#}"));
            state.root.clear();
            self.transport.send(
                LEADER,
                Message::MergeValue {
                    key: key.to_string(),
                    snapshot,
                },
            );
        }
    }

    /// Dispatch an incoming fire-and-forget message. The embedding engine
    /// calls this for every message the transport delivers.
    ///
    /// # Panics
    ///
    /// Panics if the message names a key with no asynchronous state; that
    /// means cluster state has diverged.
    pub fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::MergeValue { key, snapshot } => {
                let state = self.async_key_state(&key);
                state
                    .root
                    .merge_serialized(&snapshot)
                    .with_context(|| format!("merging remote contribution for {key:?}"))?;
                self.account_merged(&state, &key);
            }
            Message::Finalize { key, snapshot } => {
                assert_ne!(
                    self.transport.rank(),
                    LEADER,
                    "the leader finalizes in place"
                );
                let state = self.async_key_state(&key);
                state
                    .root
                    .load_serialized(&snapshot)
                    .with_context(|| format!("loading cluster value for {key:?}"))?;
                state.root.finalize(&self.context);
                state.root.clear();
                self.transport.send(LEADER, Message::FinalizeDone { key });
            }
            Message::FinalizeDone { key } => self.account_finalized(&key),
            Message::ScheduleKey { key, fire_at } => self.schedule.push(key, fire_at),
        }
        Ok(())
    }

    /// Account one process's merge-phase completion on the leader. When
    /// the last contribution is in, broadcast the cluster value for
    /// finalization and start counting acknowledgements.
    fn account_merged(&self, state: &AsyncKeyState<C, G>, key: &str) {
        assert_eq!(
            self.transport.rank(),
            LEADER,
            "merge accounting happens on the leader"
        );
        let world_size = self.transport.world_size();
        let remaining = state.cluster_remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(
            remaining > 0,
            "cluster countdown for {key:?} underflowed"
        );
        tracing::debug!(key, remaining = remaining - 1, "awaiting process contributions");
        if remaining > 1 {
            return;
        }

        tracing::info!(key, "cluster reduction complete; finalizing");
        let snapshot = state
            .root
            .snapshot()
            .unwrap_or_else(|err| panic!("snapshot of {key:?} failed: {err:#}"));
        // The countdown now counts finalization acknowledgements.
        state
            .cluster_remaining
            .store(world_size, Ordering::Release);
        for target in 1..world_size {
            self.transport.send(
                target,
                Message::Finalize {
                    key: key.to_string(),
                    snapshot: snapshot.clone(),
                },
            );
        }
        state.root.finalize(&self.context);
        state.root.clear();
        self.account_finalized(key);
    }

    /// Account one process's finalization on the leader. When every
    /// process has finalized, schedule the key's next round everywhere.
    /// Rescheduling only after all finalizations keeps two rounds of one
    /// key from ever overlapping.
    fn account_finalized(&self, key: &str) {
        let state = self.async_key_state(key);
        let world_size = self.transport.world_size();
        let remaining = state.cluster_remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(
            remaining > 0,
            "finalize countdown for {key:?} underflowed"
        );
        if remaining > 1 {
            return;
        }

        state
            .cluster_remaining
            .store(world_size, Ordering::Release);
        let start_time = *self.start_time.lock().unwrap();
        let fire_at = self.clock.now().saturating_sub(start_time) + self.period(key);
        tracing::info!(key, ?fire_at, "rescheduling");
        self.schedule.push(key.to_string(), fire_at);
        for target in 1..world_size {
            self.transport.send(
                target,
                Message::ScheduleKey {
                    key: key.to_string(),
                    fire_at,
                },
            );
        }
    }

    fn async_key_state(&self, key: &str) -> Arc<AsyncKeyState<C, G>> {
        self.async_state
            .get(key)
            .map(|entry| Arc::clone(&*entry))
            .unwrap_or_else(|| panic!("no asynchronous state for key {key:?}"))
    }

    fn period(&self, key: &str) -> Duration {
        match self.periods.lock().unwrap().get(key) {
            Some(period) => *period,
            None => panic!("scheduled key {key:?} has no period"),
        }
    }

    async fn broadcast_time(&self, value: Option<Duration>) -> Duration {
        let payload = value.map(|v| {
            Serialized::serialize(&v)
                .unwrap_or_else(|err| panic!("time serialization failed: {err:#}"))
        });
        self.transport
            .broadcast(payload)
            .await
            .deserialized::<Duration>()
            .unwrap_or_else(|err| panic!("time broadcast failed: {err:#}"))
    }

    /// Reduce the local partition into `mr` with a pool of scoped worker
    /// threads, one partial accumulator each.
    fn local_reduce(&self, mr: &dyn ErasedMapReduce<C, G>) {
        let vertices = self.graph.num_local_vertices();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(vertices.max(1));
        std::thread::scope(|scope| {
            for worker in 0..workers {
                let local = mr.clone_empty();
                scope.spawn(move || {
                    self.partial_reduce(local.as_ref(), worker, workers);
                    mr.merge(local.as_ref());
                });
            }
        });
    }

    /// Fold local vertices (or their in-edges) taken at `stride` from
    /// `offset` into `acc`. Vertex reductions skip vertices this process
    /// does not own, so replicas contribute exactly once cluster-wide.
    fn partial_reduce(&self, acc: &dyn ErasedMapReduce<C, G>, offset: usize, stride: usize) {
        let rank = self.transport.rank();
        let vertices = self.graph.num_local_vertices();
        if acc.is_vertex_map() {
            for index in (offset..vertices).step_by(stride) {
                if self.graph.owner(index) == rank {
                    let vertex = self.graph.vertex(index);
                    acc.map_vertex(&self.context, &vertex);
                }
            }
        } else {
            for index in (offset..vertices).step_by(stride) {
                for edge in self.graph.in_edges(index) {
                    acc.map_edge(&self.context, &edge);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::MemEdge;
    use crate::graph::MemGraph;
    use crate::graph::MemVertex;
    use crate::transport::local;
    use crate::transport::local::LocalTransport;

    #[derive(Default)]
    struct TestCtx {
        observed: Mutex<Vec<i64>>,
        observed_at: Mutex<Vec<Duration>>,
    }

    impl TestCtx {
        fn observed(&self) -> Vec<i64> {
            self.observed.lock().unwrap().clone()
        }

        fn observed_at(&self) -> Vec<Duration> {
            self.observed_at.lock().unwrap().clone()
        }
    }

    type TestGraph = MemGraph<i64, i64>;
    type TestAggregator = Aggregator<TestCtx, TestGraph, LocalTransport>;

    struct Node {
        aggregator: Arc<TestAggregator>,
        transport: Arc<LocalTransport>,
        context: Arc<TestCtx>,
    }

    fn record(ctx: &TestCtx, total: &i64) {
        ctx.observed.lock().unwrap().push(*total);
    }

    fn cluster(graphs: Vec<TestGraph>, clock: Arc<dyn Clock>) -> Vec<Node> {
        local::new(graphs.len())
            .into_iter()
            .zip(graphs)
            .map(|(transport, graph)| {
                let transport = Arc::new(transport);
                let context = Arc::new(TestCtx::default());
                let aggregator = Arc::new(Aggregator::with_clock(
                    Arc::clone(&transport),
                    Arc::new(graph),
                    Arc::clone(&context),
                    Arc::clone(&clock),
                ));
                Node {
                    aggregator,
                    transport,
                    context,
                }
            })
            .collect()
    }

    /// P0 owns vertices {1, 2, 3}; P1 owns {4, 5} and also holds a
    /// replica of vertex 1.
    fn vertex_partitions() -> Vec<TestGraph> {
        let mut g0 = MemGraph::new();
        g0.add_vertex(1, 0, 1);
        g0.add_vertex(2, 0, 2);
        g0.add_vertex(3, 0, 3);
        let mut g1 = MemGraph::new();
        g1.add_vertex(4, 1, 4);
        g1.add_vertex(5, 1, 5);
        g1.add_vertex(1, 0, 1);
        vec![g0, g1]
    }

    /// 7 directed edges, 4 placed on P0 and 3 on P1.
    fn edge_partitions() -> Vec<TestGraph> {
        let mut g0 = MemGraph::new();
        g0.add_vertex(1, 0, 0);
        g0.add_vertex(2, 0, 0);
        g0.add_in_edge(2, 1, 0);
        g0.add_in_edge(3, 1, 0);
        g0.add_in_edge(4, 2, 0);
        g0.add_in_edge(3, 2, 0);
        let mut g1 = MemGraph::new();
        g1.add_vertex(3, 1, 0);
        g1.add_vertex(4, 1, 0);
        g1.add_in_edge(1, 3, 0);
        g1.add_in_edge(2, 3, 0);
        g1.add_in_edge(1, 4, 0);
        vec![g0, g1]
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_vertex_sum_across_two_processes() {
        let nodes = cluster(vertex_partitions(), Arc::new(RealClock));
        for node in &nodes {
            assert!(node.aggregator.register_vertex(
                "vsum",
                |_ctx, vertex: &MemVertex<i64>| vertex.data,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        tokio::join!(a0.start(0), a1.start(0));
        let (r0, r1) = tokio::join!(a0.aggregate_now("vsum"), a1.aggregate_now("vsum"));
        assert!(r0 && r1);
        // The replica of vertex 1 on P1 must not be double counted.
        assert_eq!(nodes[0].context.observed(), vec![15]);
        assert_eq!(nodes[1].context.observed(), vec![15]);
    }

    #[tokio::test]
    async fn test_edge_count_across_two_processes() {
        let nodes = cluster(edge_partitions(), Arc::new(RealClock));
        for node in &nodes {
            assert!(node.aggregator.register_edge(
                "ecount",
                |_ctx, _edge: &MemEdge<i64>| 1i64,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        tokio::join!(a0.start(0), a1.start(0));
        tokio::join!(a0.aggregate_now("ecount"), a1.aggregate_now("ecount"));
        assert_eq!(nodes[0].context.observed(), vec![7]);
        assert_eq!(nodes[1].context.observed(), vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_round_with_two_threads_per_process() {
        let clock = Arc::new(ManualClock::new());
        let nodes = cluster(edge_partitions(), clock.clone());
        for node in &nodes {
            assert!(node.aggregator.register_edge(
                "ecount",
                |_ctx, _edge: &MemEdge<i64>| 1i64,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        let (p0, p1) = tokio::join!(
            a0.aggregate_periodic("ecount", 0.0),
            a1.aggregate_periodic("ecount", 0.0)
        );
        assert!(p0 && p1);
        tokio::join!(a0.start(2), a1.start(2));

        let dispatchers: Vec<_> = nodes
            .iter()
            .map(|node| {
                let aggregator = Arc::clone(&node.aggregator);
                let transport = Arc::clone(&node.transport);
                tokio::spawn(async move {
                    while let Some(message) = transport.recv_message().await {
                        aggregator.handle_message(message).unwrap();
                    }
                })
            })
            .collect();

        clock.advance(Duration::from_millis(10));
        for node in &nodes {
            let key = node.aggregator.tick_asynchronous().expect("a due key");
            assert_eq!(key, "ecount");
            // Nothing more to activate until the round completes.
            assert_eq!(node.aggregator.tick_asynchronous(), None);
            node.aggregator.tick_asynchronous_compute(0, &key);
            node.aggregator.tick_asynchronous_compute(1, &key);
        }

        wait_until("every process to finalize 7", || {
            nodes.iter().all(|node| node.context.observed() == vec![7])
        })
        .await;
        wait_until("the key to be rescheduled everywhere", || {
            nodes.iter().all(|node| node.aggregator.schedule.len() == 1)
        })
        .await;

        // Exactly one finalize per process for the round.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for node in &nodes {
            assert_eq!(node.context.observed(), vec![7]);
        }

        for dispatcher in dispatchers {
            dispatcher.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_rounds_follow_the_reschedule() {
        let clock = Arc::new(ManualClock::new());
        let nodes = cluster(edge_partitions(), clock.clone());
        for node in &nodes {
            assert!(node.aggregator.register_edge(
                "ecount",
                |_ctx, _edge: &MemEdge<i64>| 1i64,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        tokio::join!(
            a0.aggregate_periodic("ecount", 0.0),
            a1.aggregate_periodic("ecount", 0.0)
        );
        tokio::join!(a0.start(1), a1.start(1));

        let dispatchers: Vec<_> = nodes
            .iter()
            .map(|node| {
                let aggregator = Arc::clone(&node.aggregator);
                let transport = Arc::clone(&node.transport);
                tokio::spawn(async move {
                    while let Some(message) = transport.recv_message().await {
                        aggregator.handle_message(message).unwrap();
                    }
                })
            })
            .collect();

        for round in 1..=3usize {
            // The previous round's reschedule must land on every process
            // before the clock moves, so its fire-time is strictly in the
            // past once we advance.
            wait_until("the round to be scheduled everywhere", || {
                nodes.iter().all(|node| node.aggregator.schedule.len() == 1)
            })
            .await;
            clock.advance(Duration::from_millis(10));
            for node in &nodes {
                let key = node.aggregator.tick_asynchronous().expect("a due key");
                node.aggregator.tick_asynchronous_compute(0, &key);
            }
            wait_until("the round to finalize", || {
                nodes
                    .iter()
                    .all(|node| node.context.observed() == vec![7; round])
            })
            .await;
        }

        for dispatcher in dispatchers {
            dispatcher.abort();
        }
    }

    #[tokio::test]
    async fn test_period_is_a_lower_bound() {
        let clock = Arc::new(ManualClock::new());
        let nodes = cluster(vertex_partitions(), clock.clone());
        for node in &nodes {
            let clock = clock.clone();
            assert!(node.aggregator.register_vertex(
                "count",
                |_ctx, _vertex: &MemVertex<i64>| 1i64,
                move |ctx: &TestCtx, total: &i64| {
                    ctx.observed.lock().unwrap().push(*total);
                    ctx.observed_at.lock().unwrap().push(clock.now());
                },
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        let (p0, p1) = tokio::join!(
            a0.aggregate_periodic("count", 1.0),
            a1.aggregate_periodic("count", 1.0)
        );
        assert!(p0 && p1);
        tokio::join!(a0.start(0), a1.start(0));

        // Drive 5.1 seconds of ticks at 300ms each.
        for _ in 0..17 {
            clock.advance(Duration::from_millis(300));
            tokio::join!(a0.tick_synchronous(), a1.tick_synchronous());
        }

        for node in &nodes {
            // 5 owned vertices cluster-wide; at least 4 and at most 5
            // rounds fit in 5.1 seconds at a 1 second period.
            let observed = node.context.observed();
            assert!(observed.len() >= 4 && observed.len() <= 5, "{observed:?}");
            assert!(observed.iter().all(|total| *total == 5));
            let at = node.context.observed_at();
            for pair in at.windows(2) {
                assert!(pair[1] - pair[0] >= Duration::from_secs(1));
            }
        }
    }

    #[tokio::test]
    async fn test_period_zero_fires_every_tick() {
        let clock = Arc::new(ManualClock::new());
        let nodes = cluster(vertex_partitions(), clock.clone());
        for node in &nodes {
            assert!(node.aggregator.register_vertex(
                "count",
                |_ctx, _vertex: &MemVertex<i64>| 1i64,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        tokio::join!(
            a0.aggregate_periodic("count", 0.0),
            a1.aggregate_periodic("count", 0.0)
        );
        tokio::join!(a0.start(0), a1.start(0));

        for tick in 1..=5usize {
            clock.advance(Duration::from_millis(100));
            tokio::join!(a0.tick_synchronous(), a1.tick_synchronous());
            for node in &nodes {
                assert_eq!(node.context.observed().len(), tick);
            }
        }
    }

    #[tokio::test]
    async fn test_prime_pass_runs_every_periodic_key() {
        let nodes = cluster(edge_partitions(), Arc::new(RealClock));
        for node in &nodes {
            assert!(node.aggregator.register_edge(
                "ecount",
                |_ctx, _edge: &MemEdge<i64>| 1i64,
                record,
            ));
            assert!(node.aggregator.register_vertex(
                "vcount",
                |_ctx, _vertex: &MemVertex<i64>| 1i64,
                record,
            ));
        }
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        tokio::join!(
            a0.aggregate_periodic("ecount", 10.0),
            a1.aggregate_periodic("ecount", 10.0)
        );
        tokio::join!(
            a0.aggregate_periodic("vcount", 10.0),
            a1.aggregate_periodic("vcount", 10.0)
        );
        tokio::join!(a0.aggregate_all_periodic(), a1.aggregate_all_periodic());
        for node in &nodes {
            // Key order: "ecount" (7 edges) then "vcount" (4 owned
            // vertices).
            assert_eq!(node.context.observed(), vec![7, 4]);
        }
    }

    #[tokio::test]
    async fn test_registration_boundaries() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        let aggregator = &nodes[0].aggregator;
        assert!(!aggregator.register_vertex(
            "",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        assert!(aggregator.register_vertex(
            "vsum",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        // Duplicate keys are rejected, across domains too.
        assert!(!aggregator.register_vertex(
            "vsum",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        assert!(!aggregator.register_edge("vsum", |_ctx, _edge: &MemEdge<i64>| 1i64, record));
    }

    #[tokio::test]
    async fn test_periodic_registration_boundaries() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        let aggregator = &nodes[0].aggregator;
        assert!(aggregator.register_vertex(
            "vsum",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        assert!(!aggregator.aggregate_periodic("vsum", -1.0).await);
        assert!(!aggregator.aggregate_periodic("vsum", f64::NAN).await);
        assert!(!aggregator.aggregate_periodic("missing", 1.0).await);
        assert!(aggregator.aggregate_periodic("vsum", 0.0).await);
        // Updating an existing period is allowed.
        assert!(aggregator.aggregate_periodic("vsum", 2.5).await);
        assert_eq!(
            aggregator.list_periodic_keys(),
            ["vsum".to_string()].into_iter().collect()
        );
    }

    #[tokio::test]
    #[should_panic(expected = "not found")]
    async fn test_aggregate_now_unknown_key_is_fatal() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        nodes[0].aggregator.aggregate_now("missing").await;
    }

    #[tokio::test]
    #[should_panic(expected = "no asynchronous state")]
    async fn test_compute_without_async_state_is_fatal() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        nodes[0].aggregator.tick_asynchronous_compute(0, "missing");
    }

    #[tokio::test]
    async fn test_stop_start_keeps_registrations_and_values() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        let aggregator = &nodes[0].aggregator;
        assert!(aggregator.register_vertex(
            "vsum",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        assert!(aggregator.aggregate_periodic("vsum", 1.0).await);
        aggregator.start(0).await;
        assert!(aggregator.aggregate_now("vsum").await);
        aggregator.stop();
        assert_eq!(aggregator.schedule.len(), 0);
        // Registrations and periods survive; the next run reproduces the
        // same value on the same graph.
        assert!(aggregator.list_periodic_keys().contains("vsum"));
        aggregator.start(0).await;
        assert!(aggregator.aggregate_now("vsum").await);
        assert_eq!(nodes[0].context.observed(), vec![6, 6]);
    }

    #[tokio::test]
    async fn test_start_with_ncpus_arms_async_state() {
        let nodes = cluster(vec![vertex_partitions().remove(0)], Arc::new(RealClock));
        let aggregator = &nodes[0].aggregator;
        assert!(aggregator.register_vertex(
            "vsum",
            |_ctx, vertex: &MemVertex<i64>| vertex.data,
            record
        ));
        assert!(aggregator.aggregate_periodic("vsum", 1.0).await);

        aggregator.start(0).await;
        assert!(aggregator.async_state.is_empty());

        aggregator.start(3).await;
        assert_eq!(aggregator.async_state.len(), 1);
        assert_eq!(
            aggregator.async_state.get("vsum").unwrap().per_thread.len(),
            3
        );

        aggregator.stop();
        assert!(aggregator.async_state.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_registration_fails_on_load() {
        // P1 registers a different reduction type under the same key; its
        // snapshot reaches P0 through the merge message and must be
        // rejected rather than decoded.
        let nodes = cluster(edge_partitions(), Arc::new(RealClock));
        let (a0, a1) = (&nodes[0].aggregator, &nodes[1].aggregator);
        assert!(a0.register_edge("ecount", |_ctx, _edge: &MemEdge<i64>| 1i64, record));
        assert!(a1.register_edge(
            "ecount",
            |_ctx, _edge: &MemEdge<i64>| 1.0f64,
            |_ctx, _total: &f64| (),
        ));
        tokio::join!(
            a0.aggregate_periodic("ecount", 0.0),
            a1.aggregate_periodic("ecount", 0.0)
        );
        tokio::join!(a0.start(1), a1.start(1));

        // P1 computes its round and ships its (f64) snapshot to P0.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let key = a1.tick_asynchronous().expect("a due key");
        a1.tick_asynchronous_compute(0, &key);
        let message = nodes[0]
            .transport
            .recv_message()
            .await
            .expect("the merge message");
        assert!(a0.handle_message(message).is_err());
    }
}
