/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Two in-process "processes" computing an edge count and a vertex value
//! sum over a small partitioned graph, on a periodic synchronous tick.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use graphfold::Aggregator;
use graphfold::MemEdge;
use graphfold::MemGraph;
use graphfold::MemVertex;
use graphfold::transport::local;

#[derive(Default)]
struct Report {
    lines: Mutex<Vec<String>>,
}

fn partitions() -> Vec<MemGraph<i64, ()>> {
    // Vertices 1..=4; edges 1->2, 2->3, 3->4, 4->1, 1->3. Each edge lives
    // on the process owning its target.
    let mut g0 = MemGraph::new();
    g0.add_vertex(1, 0, 10);
    g0.add_vertex(2, 0, 20);
    g0.add_in_edge(4, 1, ());
    g0.add_in_edge(1, 2, ());
    let mut g1 = MemGraph::new();
    g1.add_vertex(3, 1, 30);
    g1.add_vertex(4, 1, 40);
    g1.add_in_edge(2, 3, ());
    g1.add_in_edge(1, 3, ());
    g1.add_in_edge(3, 4, ());
    vec![g0, g1]
}

#[tokio::main]
async fn main() {
    let nodes: Vec<_> = local::new(2)
        .into_iter()
        .zip(partitions())
        .enumerate()
        .map(|(rank, (transport, graph))| {
            let report = Arc::new(Report::default());
            let aggregator = Aggregator::new(
                Arc::new(transport),
                Arc::new(graph),
                Arc::clone(&report),
            );
            assert!(aggregator.register_edge(
                "edges",
                |_report, _edge: &MemEdge<()>| 1i64,
                move |report: &Report, count: &i64| {
                    report
                        .lines
                        .lock()
                        .unwrap()
                        .push(format!("process {rank}: {count} edges"));
                },
            ));
            assert!(aggregator.register_vertex(
                "values",
                |_report, vertex: &MemVertex<i64>| vertex.data,
                move |report: &Report, total: &i64| {
                    report
                        .lines
                        .lock()
                        .unwrap()
                        .push(format!("process {rank}: value sum {total}"));
                },
            ));
            (aggregator, report)
        })
        .collect();

    let (a0, a1) = (&nodes[0].0, &nodes[1].0);
    let (r0, r1) = tokio::join!(
        a0.aggregate_periodic("edges", 0.05),
        a1.aggregate_periodic("edges", 0.05)
    );
    assert!(r0 && r1);
    let (r0, r1) = tokio::join!(
        a0.aggregate_periodic("values", 0.05),
        a1.aggregate_periodic("values", 0.05)
    );
    assert!(r0 && r1);

    tokio::join!(a0.start(0), a1.start(0));
    tokio::join!(a0.aggregate_all_periodic(), a1.aggregate_all_periodic());

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::join!(a0.tick_synchronous(), a1.tick_synchronous());
    }
    a0.stop();
    a1.stop();

    for (_, report) in &nodes {
        for line in report.lines.lock().unwrap().iter() {
            println!("{line}");
        }
    }
}
