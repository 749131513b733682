//! Steady-state `process` must never touch the allocator.

use crosswire_graph::{AudioGraph, Connection, ConnectionKind, Gain, PassThrough};
use crosswire_rt::alloc_guard::{allocation_count, CountingAllocator};
use crosswire_rt::{AudioBuffer, PoolTopology};

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

#[test]
fn process_is_allocation_free_after_prepare() {
    let topology = PoolTopology {
        workers: 0,
        pin_workers: false,
    };
    let graph = AudioGraph::new(2, &topology);
    let a = graph.add_node(Box::new(Gain::new(0.5)));
    let b = graph.add_node(Box::new(PassThrough));
    for ch in 0..2 {
        for (from, to) in [
            (graph.input_node(), a),
            (a, b),
            (b, graph.output_node()),
        ] {
            graph
                .add_connection(Connection {
                    source: (from, ch),
                    destination: (to, ch),
                    kind: ConnectionKind::Audio,
                })
                .unwrap();
        }
    }
    graph.prepare(48_000.0, 128);

    let mut buffer = AudioBuffer::new(2, 128);
    // Warm-up: lazy one-time paths (lock parking, thread-locals).
    for _ in 0..16 {
        graph.process(&mut buffer, 128, &[]);
    }

    let before = allocation_count();
    for _ in 0..1_000 {
        graph.process(&mut buffer, 128, &[]);
    }
    let after = allocation_count();
    assert_eq!(before, after, "process allocated on the steady-state path");
}
