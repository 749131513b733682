use std::collections::BTreeMap;

use crate::graph::Connection;
use crate::partitioner::{DagNode, DagPartitioner, NodeId, Subgraph};

/// A partitioned chain annotated with the I/O boundary nodes it touches,
/// ready for the graph to compile into a runtime task.
#[derive(Debug, Clone, Default)]
pub struct ChainSpec {
    /// Nodes in execution order.
    pub node_ids: Vec<NodeId>,
    /// Excluded boundary nodes with edges into this chain.
    pub input_nodes: Vec<NodeId>,
    /// Excluded boundary nodes this chain feeds.
    pub output_nodes: Vec<NodeId>,
    pub depends_on: Vec<usize>,
    pub dependents: Vec<usize>,
    pub level: i32,
}

/// Adapts the processor graph's node/connection lists to the partitioner
/// and maps the result back with boundary annotations.
///
/// Audio and MIDI connections both contribute edges: either kind imposes
/// execution ordering. Per-channel duplicates collapse to one edge per
/// node pair.
pub struct SubgraphExtractor {
    partitioner: DagPartitioner,
    dag_nodes: BTreeMap<NodeId, DagNode>,
}

impl Default for SubgraphExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SubgraphExtractor {
    pub fn new() -> Self {
        Self {
            partitioner: DagPartitioner::new(),
            dag_nodes: BTreeMap::new(),
        }
    }

    /// Partitions the graph into chains, excluding `io_nodes` from
    /// scheduling while keeping their edges visible as boundaries.
    pub fn extract(
        &mut self,
        node_ids: &[NodeId],
        connections: &[Connection],
        io_nodes: &[NodeId],
    ) -> Vec<ChainSpec> {
        self.dag_nodes.clear();
        for id in node_ids {
            self.dag_nodes.entry(*id).or_default();
        }
        for io in io_nodes {
            self.dag_nodes.entry(*io).or_default();
        }
        for conn in connections {
            let (source, destination) = (conn.source.0, conn.destination.0);
            if let Some(node) = self.dag_nodes.get_mut(&source) {
                if !node.outputs_to.contains(&destination) {
                    node.outputs_to.push(destination);
                }
            }
            if let Some(node) = self.dag_nodes.get_mut(&destination) {
                if !node.inputs_from.contains(&source) {
                    node.inputs_from.push(source);
                }
            }
        }

        let subgraphs = self.partitioner.extract_subgraphs(&self.dag_nodes, io_nodes);

        subgraphs
            .into_iter()
            .map(|sg| {
                let mut spec = ChainSpec {
                    node_ids: sg.node_ids,
                    depends_on: sg.depends_on,
                    dependents: sg.dependents,
                    level: sg.level,
                    ..ChainSpec::default()
                };
                for id in &spec.node_ids {
                    let Some(node) = self.dag_nodes.get(id) else { continue };
                    for input in &node.inputs_from {
                        if io_nodes.contains(input) && !spec.input_nodes.contains(input) {
                            spec.input_nodes.push(*input);
                        }
                    }
                    for output in &node.outputs_to {
                        if io_nodes.contains(output) && !spec.output_nodes.contains(output) {
                            spec.output_nodes.push(*output);
                        }
                    }
                }
                spec
            })
            .collect()
    }

    /// Builds dependency edges and levels for chains produced by the last
    /// [`SubgraphExtractor::extract`] call.
    pub fn schedule(&mut self, chains: &mut [ChainSpec], num_workers: Option<usize>) {
        if chains.is_empty() {
            return;
        }
        let mut subgraphs: Vec<Subgraph> = chains
            .iter()
            .map(|chain| Subgraph {
                node_ids: chain.node_ids.clone(),
                depends_on: chain.depends_on.clone(),
                dependents: chain.dependents.clone(),
                level: chain.level,
            })
            .collect();

        self.partitioner
            .build_dependencies(&mut subgraphs, &self.dag_nodes, num_workers);

        for (chain, sg) in chains.iter_mut().zip(subgraphs) {
            chain.depends_on = sg.depends_on;
            chain.dependents = sg.dependents;
            chain.level = sg.level;
        }
    }
}
