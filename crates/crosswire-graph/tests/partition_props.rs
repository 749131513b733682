//! Property tests for the DAG partitioner over random acyclic graphs.

use std::collections::{BTreeMap, HashMap, HashSet};

use crosswire_graph::{DagNode, DagPartitioner, NodeId};
use proptest::prelude::*;

/// Random DAG: edges only run from lower to higher ids, so the input is
/// acyclic by construction.
fn arbitrary_dag() -> impl Strategy<Value = BTreeMap<NodeId, DagNode>> {
    (2usize..24, proptest::collection::vec((any::<u32>(), any::<u32>()), 0..64)).prop_map(
        |(count, raw_edges)| {
            let mut nodes: BTreeMap<NodeId, DagNode> = BTreeMap::new();
            for id in 0..count as NodeId {
                nodes.insert(id, DagNode::default());
            }
            for (a, b) in raw_edges {
                let from = (a as usize % count) as NodeId;
                let to = (b as usize % count) as NodeId;
                if from >= to {
                    continue;
                }
                let outputs = &mut nodes.get_mut(&from).unwrap().outputs_to;
                if !outputs.contains(&to) {
                    outputs.push(to);
                }
                let inputs = &mut nodes.get_mut(&to).unwrap().inputs_from;
                if !inputs.contains(&from) {
                    inputs.push(from);
                }
            }
            nodes
        },
    )
}

proptest! {
    #[test]
    fn every_node_lands_in_exactly_one_subgraph(nodes in arbitrary_dag()) {
        let mut partitioner = DagPartitioner::new();
        let subgraphs = partitioner.extract_subgraphs(&nodes, &[]);

        let mut seen: HashSet<NodeId> = HashSet::new();
        for sg in &subgraphs {
            for id in &sg.node_ids {
                prop_assert!(seen.insert(*id), "node {} scheduled twice", id);
            }
        }
        let all: HashSet<NodeId> = nodes.keys().copied().collect();
        prop_assert_eq!(seen, all);
    }

    #[test]
    fn chains_are_linear_inside(nodes in arbitrary_dag()) {
        let mut partitioner = DagPartitioner::new();
        let subgraphs = partitioner.extract_subgraphs(&nodes, &[]);

        for sg in &subgraphs {
            if sg.node_ids.len() < 2 {
                continue;
            }
            for (pos, id) in sg.node_ids.iter().enumerate() {
                let node = &nodes[id];
                prop_assert_eq!(
                    node.inputs_from.len(),
                    1,
                    "chain member {} has fan-in {}",
                    id,
                    node.inputs_from.len()
                );
                if pos + 1 < sg.node_ids.len() {
                    prop_assert_eq!(
                        node.outputs_to.len(),
                        1,
                        "interior chain member {} has fan-out {}",
                        id,
                        node.outputs_to.len()
                    );
                    prop_assert_eq!(node.outputs_to[0], sg.node_ids[pos + 1]);
                }
            }
        }
    }

    #[test]
    fn cross_subgraph_edges_run_to_strictly_later_levels(nodes in arbitrary_dag()) {
        let mut partitioner = DagPartitioner::new();
        let mut subgraphs = partitioner.extract_subgraphs(&nodes, &[]);
        partitioner.build_dependencies(&mut subgraphs, &nodes, None);

        let owner: HashMap<NodeId, usize> = subgraphs
            .iter()
            .enumerate()
            .flat_map(|(i, sg)| sg.node_ids.iter().map(move |id| (*id, i)))
            .collect();

        for (id, node) in &nodes {
            let from = owner[id];
            for out in &node.outputs_to {
                let to = owner[out];
                if from != to {
                    prop_assert!(
                        subgraphs[to].level > subgraphs[from].level,
                        "edge {}->{} maps levels {} -> {}",
                        id, out, subgraphs[from].level, subgraphs[to].level
                    );
                }
            }
        }
    }

    #[test]
    fn dependency_graph_is_schedulable(nodes in arbitrary_dag()) {
        let mut partitioner = DagPartitioner::new();
        let mut subgraphs = partitioner.extract_subgraphs(&nodes, &[]);
        partitioner.build_dependencies(&mut subgraphs, &nodes, Some(4));

        // Simulate the runtime gate: repeatedly complete subgraphs whose
        // dependencies are done. Everything must drain.
        let mut done = vec![false; subgraphs.len()];
        loop {
            let mut progressed = false;
            for i in 0..subgraphs.len() {
                if done[i] {
                    continue;
                }
                if subgraphs[i].depends_on.iter().all(|d| done[*d]) {
                    done[i] = true;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        prop_assert!(done.iter().all(|d| *d), "schedule cannot drain");
    }
}
