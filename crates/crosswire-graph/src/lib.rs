//! Crosswire graph
//! ===============
//! A multithreaded audio processor graph: user-authored DAGs of black-box
//! processors are cut into linear chains, levelled, and dispatched across a
//! pinned realtime worker pool with deterministic per-block latency. Graph
//! edits happen on control threads; the realtime `process` call only ever
//! reads the schedule compiled by the last `prepare`.

pub mod extractor;
pub mod graph;
pub mod partitioner;
pub mod pool;
pub mod processor;
pub mod task_graph;

pub use extractor::{ChainSpec, SubgraphExtractor};
pub use graph::{AudioGraph, Connection, ConnectionKind, GraphError};
pub use partitioner::{DagNode, DagPartitioner, NodeId, Subgraph};
pub use pool::{BlockWork, RealtimeThreadPool};
pub use processor::{Gain, PassThrough, Processor};
pub use task_graph::DependencyTaskGraph;
