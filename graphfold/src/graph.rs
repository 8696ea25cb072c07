/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The aggregator's view of a partitioned graph.
//!
//! A process sees only its local partition: a sequence of local vertices,
//! each with an owning process, plus the in-edges of each local vertex.
//! Vertices replicated onto several processes (ghosts) are owned by
//! exactly one of them; vertex reductions consult [`Graph::owner`] so that
//! every vertex is counted once cluster-wide. Edge reductions iterate the
//! in-edges of local vertices only, which covers every directed edge
//! exactly once provided the partitioner places each edge on the process
//! holding its target.

/// A local partition of a distributed graph.
pub trait Graph: Send + Sync + 'static {
    /// The user-facing vertex value passed to vertex map callbacks.
    type Vertex;

    /// The user-facing edge value passed to edge map callbacks.
    type Edge;

    /// Number of vertices in the local partition, owned or replicated.
    fn num_local_vertices(&self) -> usize;

    /// The process owning the local vertex at `index`.
    fn owner(&self, index: usize) -> usize;

    /// Materialize the user-facing value of the local vertex at `index`.
    fn vertex(&self, index: usize) -> Self::Vertex;

    /// Materialize the in-edges of the local vertex at `index`.
    fn in_edges(&self, index: usize) -> Vec<Self::Edge>;
}

/// A vertex of a [`MemGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemVertex<V> {
    /// Global vertex id.
    pub id: u64,
    /// The process owning this vertex.
    pub owner: usize,
    /// User payload.
    pub data: V,
}

/// A directed edge of a [`MemGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemEdge<E> {
    /// Global id of the source vertex.
    pub source: u64,
    /// Global id of the target vertex.
    pub target: u64,
    /// User payload.
    pub data: E,
}

/// A fixed in-memory partition, useful for tests and single-machine runs.
///
/// The builder records vertices in insertion order; in-edges are attached
/// to the local copy of their target vertex.
#[derive(Debug, Default)]
pub struct MemGraph<V, E> {
    vertices: Vec<MemVertex<V>>,
    in_edges: Vec<Vec<MemEdge<E>>>,
}

impl<V, E> MemGraph<V, E> {
    /// An empty partition.
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            in_edges: Vec::new(),
        }
    }

    /// Add a local vertex with the given global id, owner, and payload.
    pub fn add_vertex(&mut self, id: u64, owner: usize, data: V) {
        self.vertices.push(MemVertex { id, owner, data });
        self.in_edges.push(Vec::new());
    }

    /// Attach an in-edge to the local copy of vertex `target`.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not a local vertex.
    pub fn add_in_edge(&mut self, source: u64, target: u64, data: E) {
        let index = self
            .vertices
            .iter()
            .position(|v| v.id == target)
            .unwrap_or_else(|| panic!("vertex {target} is not in this partition"));
        self.in_edges[index].push(MemEdge {
            source,
            target,
            data,
        });
    }
}

impl<V, E> Graph for MemGraph<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Vertex = MemVertex<V>;
    type Edge = MemEdge<E>;

    fn num_local_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn owner(&self, index: usize) -> usize {
        self.vertices[index].owner
    }

    fn vertex(&self, index: usize) -> Self::Vertex {
        self.vertices[index].clone()
    }

    fn in_edges(&self, index: usize) -> Vec<Self::Edge> {
        self.in_edges[index].clone()
    }
}
