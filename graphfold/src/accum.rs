/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Type-erased map-reduce accumulators.
//!
//! Each registered aggregation reduces values of some type `R` that only
//! the registration site knows. [`ErasedMapReduce`] is the "type-free"
//! interface the executors drive: absorb a vertex or edge, merge with a
//! sibling accumulator, snapshot to a wire value, load from one, finalize.
//! [`MapReduce`] is the one generic implementation, parameterized by the
//! reduction type and capturing the user's map and finalize callbacks.
//!
//! The accumulated state is `Option<R>`: empty until the first absorption,
//! merged through the conditional monoid lift, so `R` needs only an
//! associative, commutative `combine`. A round that reduces nothing
//! finalizes with `R::default()`.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;

use algebra::Semigroup;
use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::data::Serialized;
use crate::graph::Graph;

/// The type-free specification of one reduction, together with its
/// mutable accumulator cell. All operations are thread safe; concurrent
/// absorptions and merges serialize on the cell's internal lock.
pub(crate) trait ErasedMapReduce<C, G: Graph>: Send + Sync {
    /// A fresh accumulator of identical specification and empty state.
    fn clone_empty(&self) -> Box<dyn ErasedMapReduce<C, G>>;

    /// Map the given vertex and fold the result into the accumulator.
    fn map_vertex(&self, context: &C, vertex: &G::Vertex);

    /// Map the given edge and fold the result into the accumulator.
    fn map_edge(&self, context: &C, edge: &G::Edge);

    /// True if the reduction is over vertices, false if over edges.
    fn is_vertex_map(&self) -> bool;

    /// Fold another accumulator of the same specification into this one.
    ///
    /// # Panics
    ///
    /// Panics if `other` was built from a different reduction type.
    fn merge(&self, other: &dyn ErasedMapReduce<C, G>);

    /// The current state as an opaque wire value.
    fn snapshot(&self) -> anyhow::Result<Serialized>;

    /// Fold a snapshotted state into this accumulator.
    fn merge_serialized(&self, other: &Serialized) -> anyhow::Result<()>;

    /// Replace this accumulator's state with a snapshotted one.
    fn load_serialized(&self, value: &Serialized) -> anyhow::Result<()>;

    /// Reset the accumulator to empty.
    fn clear(&self);

    /// Invoke the finalize callback on the current state.
    fn finalize(&self, context: &C);

    fn as_any(&self) -> &dyn Any;
}

enum MapFn<C, G: Graph, R> {
    Vertex(Arc<dyn Fn(&C, &G::Vertex) -> R + Send + Sync>),
    Edge(Arc<dyn Fn(&C, &G::Edge) -> R + Send + Sync>),
}

impl<C, G: Graph, R> Clone for MapFn<C, G, R> {
    fn clone(&self) -> Self {
        match self {
            MapFn::Vertex(f) => MapFn::Vertex(Arc::clone(f)),
            MapFn::Edge(f) => MapFn::Edge(Arc::clone(f)),
        }
    }
}

/// The generic [`ErasedMapReduce`] implementation for reduction type `R`.
pub(crate) struct MapReduce<C, G: Graph, R> {
    map: MapFn<C, G, R>,
    finalize: Arc<dyn Fn(&C, &R) + Send + Sync>,
    cell: Mutex<Option<R>>,
}

impl<C, G: Graph, R> MapReduce<C, G, R> {
    /// A vertex reduction.
    pub(crate) fn vertex<M, F>(map: M, finalize: F) -> Self
    where
        M: Fn(&C, &G::Vertex) -> R + Send + Sync + 'static,
        F: Fn(&C, &R) + Send + Sync + 'static,
    {
        Self {
            map: MapFn::Vertex(Arc::new(map)),
            finalize: Arc::new(finalize),
            cell: Mutex::new(None),
        }
    }

    /// An edge reduction.
    pub(crate) fn edge<M, F>(map: M, finalize: F) -> Self
    where
        M: Fn(&C, &G::Edge) -> R + Send + Sync + 'static,
        F: Fn(&C, &R) + Send + Sync + 'static,
    {
        Self {
            map: MapFn::Edge(Arc::new(map)),
            finalize: Arc::new(finalize),
            cell: Mutex::new(None),
        }
    }
}

impl<C, G: Graph, R> MapReduce<C, G, R>
where
    R: Semigroup,
{
    fn absorb(&self, value: R) {
        let mut cell = self.cell.lock().unwrap();
        match cell.as_mut() {
            Some(acc) => acc.combine_assign(&value),
            None => *cell = Some(value),
        }
    }
}

impl<C, G, R> ErasedMapReduce<C, G> for MapReduce<C, G, R>
where
    C: Send + Sync + 'static,
    G: Graph,
    R: Semigroup
        + Clone
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn clone_empty(&self) -> Box<dyn ErasedMapReduce<C, G>> {
        Box::new(Self {
            map: self.map.clone(),
            finalize: Arc::clone(&self.finalize),
            cell: Mutex::new(None),
        })
    }

    fn map_vertex(&self, context: &C, vertex: &G::Vertex) {
        match &self.map {
            MapFn::Vertex(f) => self.absorb(f(context, vertex)),
            MapFn::Edge(_) => panic!("vertex mapped through an edge reduction"),
        }
    }

    fn map_edge(&self, context: &C, edge: &G::Edge) {
        match &self.map {
            MapFn::Edge(f) => self.absorb(f(context, edge)),
            MapFn::Vertex(_) => panic!("edge mapped through a vertex reduction"),
        }
    }

    fn is_vertex_map(&self) -> bool {
        matches!(self.map, MapFn::Vertex(_))
    }

    fn merge(&self, other: &dyn ErasedMapReduce<C, G>) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .unwrap_or_else(|| {
                panic!(
                    "merging accumulators of different reduction types ({})",
                    std::any::type_name::<R>()
                )
            });
        // Take the other side's state first so the two cell locks are
        // never held together.
        let theirs = other.cell.lock().unwrap().clone();
        let mut cell = self.cell.lock().unwrap();
        cell.combine_assign(&theirs);
    }

    fn snapshot(&self) -> anyhow::Result<Serialized> {
        let state = self.cell.lock().unwrap().clone();
        Serialized::serialize(&state)
            .with_context(|| format!("snapshot of {}", std::any::type_name::<R>()))
    }

    fn merge_serialized(&self, other: &Serialized) -> anyhow::Result<()> {
        let theirs = other
            .deserialized::<Option<R>>()
            .context("merging a snapshot of a different reduction type")?;
        let mut cell = self.cell.lock().unwrap();
        cell.combine_assign(&theirs);
        Ok(())
    }

    fn load_serialized(&self, value: &Serialized) -> anyhow::Result<()> {
        let state = value
            .deserialized::<Option<R>>()
            .context("loading a snapshot of a different reduction type")?;
        *self.cell.lock().unwrap() = state;
        Ok(())
    }

    fn clear(&self) {
        *self.cell.lock().unwrap() = None;
    }

    fn finalize(&self, context: &C) {
        // Clone out of the cell so the user callback runs unlocked.
        let state = self.cell.lock().unwrap().clone();
        match state {
            Some(value) => (self.finalize)(context, &value),
            None => (self.finalize)(context, &R::default()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
