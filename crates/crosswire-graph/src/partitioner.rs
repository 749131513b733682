use std::collections::{BTreeMap, HashMap, HashSet};

pub type NodeId = u32;

/// Connectivity of one node as seen by the partitioner. Channel information
/// is already collapsed: an edge appears once per node pair.
#[derive(Debug, Clone, Default)]
pub struct DagNode {
    pub outputs_to: Vec<NodeId>,
    pub inputs_from: Vec<NodeId>,
}

/// A schedule unit: a linear chain of nodes, its dependency edges to other
/// subgraphs, and its topological level.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    /// Nodes in execution order (upstream first).
    pub node_ids: Vec<NodeId>,
    pub depends_on: Vec<usize>,
    pub dependents: Vec<usize>,
    pub level: i32,
}

/// Decomposes a DAG into linear chains and assigns ALAP levels.
///
/// Tracing rules, applied backwards from output endpoints:
/// - a node whose count of non-excluded successors is not exactly one ends
///   a chain (endpoint);
/// - a node with other than one predecessor is a join point and becomes a
///   single-node subgraph, with tracing restarted into each predecessor;
/// - excluded nodes (the graph's I/O boundary) terminate chains and never
///   join one.
///
/// Every non-excluded node lands in exactly one subgraph. Cycles are not
/// preserved: subgraphs the level fixed point cannot place are collapsed to
/// a common level and their back-edges dropped, so feedback must be
/// expressed with an explicit delay node to be sample-accurate.
pub struct DagPartitioner {
    visited: HashSet<NodeId>,
    exclude: HashSet<NodeId>,
    current_chain: Vec<NodeId>,
    subgraphs: Vec<Subgraph>,
}

impl Default for DagPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl DagPartitioner {
    pub fn new() -> Self {
        Self {
            visited: HashSet::new(),
            exclude: HashSet::new(),
            current_chain: Vec::new(),
            subgraphs: Vec::new(),
        }
    }

    /// Cuts `nodes` into linear-chain subgraphs, ignoring `exclude` (I/O
    /// boundary nodes). Dependency edges and levels are left for
    /// [`DagPartitioner::build_dependencies`].
    pub fn extract_subgraphs(
        &mut self,
        nodes: &BTreeMap<NodeId, DagNode>,
        exclude: &[NodeId],
    ) -> Vec<Subgraph> {
        self.subgraphs.clear();
        self.visited.clear();
        self.current_chain.clear();
        self.exclude = exclude.iter().copied().collect();

        if nodes.is_empty() {
            return Vec::new();
        }

        // Endpoints: non-excluded successor count != 1.
        let mut endpoints = Vec::new();
        for (id, node) in nodes {
            if self.exclude.contains(id) {
                continue;
            }
            let live_outputs = node
                .outputs_to
                .iter()
                .filter(|out| !self.exclude.contains(out))
                .count();
            if live_outputs != 1 {
                endpoints.push(*id);
            }
        }

        for endpoint in endpoints {
            if !self.visited.contains(&endpoint) {
                self.current_chain.clear();
                self.trace_backwards(endpoint, nodes);
            }
        }

        // Side-effect processors: connected upstream but reaching no
        // endpoint (their single successor chain loops or dead-ends).
        let pending: Vec<NodeId> = nodes
            .iter()
            .filter(|(id, node)| {
                !self.exclude.contains(id) && !self.visited.contains(id) && !node.inputs_from.is_empty()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            if !self.visited.contains(&id) {
                self.current_chain.clear();
                self.trace_backwards(id, nodes);
            }
        }

        // Orphans with no connections at all.
        for (id, _) in nodes {
            if !self.exclude.contains(id) && !self.visited.contains(id) {
                self.visited.insert(*id);
                self.subgraphs.push(Subgraph {
                    node_ids: vec![*id],
                    ..Subgraph::default()
                });
            }
        }

        std::mem::take(&mut self.subgraphs)
    }

    fn trace_backwards(&mut self, id: NodeId, nodes: &BTreeMap<NodeId, DagNode>) {
        if self.visited.contains(&id) || self.exclude.contains(&id) {
            self.finalize_chain();
            return;
        }
        let Some(node) = nodes.get(&id) else {
            return;
        };

        if node.inputs_from.len() != 1 {
            // Join point or source: ends the running chain and stands alone.
            self.finalize_chain();
            self.visited.insert(id);
            self.subgraphs.push(Subgraph {
                node_ids: vec![id],
                ..Subgraph::default()
            });
            let predecessors = node.inputs_from.clone();
            for pred in predecessors {
                self.current_chain.clear();
                self.trace_backwards(pred, nodes);
            }
            return;
        }

        self.current_chain.push(id);
        self.visited.insert(id);
        let upstream = node.inputs_from[0];
        self.trace_backwards(upstream, nodes);
    }

    fn finalize_chain(&mut self) {
        if self.current_chain.is_empty() {
            return;
        }
        let mut node_ids = std::mem::take(&mut self.current_chain);
        // Tracing walked downstream-to-upstream; store execution order.
        node_ids.reverse();
        self.subgraphs.push(Subgraph {
            node_ids,
            ..Subgraph::default()
        });
    }

    /// Builds inter-subgraph dependency edges, assigns ALAP levels, breaks
    /// cycles, and optionally balances level widths against `num_workers`.
    pub fn build_dependencies(
        &mut self,
        subgraphs: &mut [Subgraph],
        nodes: &BTreeMap<NodeId, DagNode>,
        num_workers: Option<usize>,
    ) {
        if subgraphs.is_empty() {
            return;
        }

        for sg in subgraphs.iter_mut() {
            sg.depends_on.clear();
            sg.dependents.clear();
            sg.level = 0;
        }

        // Node -> owning subgraph, then edge projection.
        let mut owner: HashMap<NodeId, usize> = HashMap::new();
        for (index, sg) in subgraphs.iter().enumerate() {
            for id in &sg.node_ids {
                owner.insert(*id, index);
            }
        }
        let mut all_deps: Vec<(usize, Vec<usize>)> = Vec::new();
        for (index, sg) in subgraphs.iter().enumerate() {
            let mut deps = Vec::new();
            for id in &sg.node_ids {
                let Some(node) = nodes.get(id) else { continue };
                for out in &node.outputs_to {
                    if let Some(&target) = owner.get(out) {
                        if target != index && !deps.contains(&target) {
                            deps.push(target);
                        }
                    }
                }
            }
            all_deps.push((index, deps));
        }
        for (index, deps) in all_deps {
            for target in deps {
                if !subgraphs[index].dependents.contains(&target) {
                    subgraphs[index].dependents.push(target);
                }
                if !subgraphs[target].depends_on.contains(&index) {
                    subgraphs[target].depends_on.push(index);
                }
            }
        }

        // ASAP fixed point to find the critical-path length.
        let count = subgraphs.len();
        let mut assigned = vec![false; count];
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..count {
                if assigned[i] {
                    continue;
                }
                let mut max_dep_level = -1;
                let mut ready = true;
                for &dep in &subgraphs[i].depends_on {
                    if !assigned[dep] {
                        ready = false;
                        break;
                    }
                    max_dep_level = max_dep_level.max(subgraphs[dep].level);
                }
                if ready {
                    subgraphs[i].level = max_dep_level + 1;
                    assigned[i] = true;
                    changed = true;
                }
            }
        }

        let cyclic: Vec<usize> = (0..count).filter(|i| !assigned[*i]).collect();
        if !cyclic.is_empty() {
            tracing::warn!(
                subgraphs = cyclic.len(),
                "dependency cycle in processor graph; breaking back-edges and collapsing to a common level"
            );
            break_cycles(subgraphs, &cyclic);
        }

        let mut max_level = subgraphs.iter().map(|sg| sg.level).max().unwrap_or(0);
        let common = max_level + 1;
        for &i in &cyclic {
            subgraphs[i].level = common;
        }
        max_level = subgraphs.iter().map(|sg| sg.level).max().unwrap_or(0);

        // ALAP: sinks sit at max_level, everything else lands just before
        // its earliest dependent. Collapsed subgraphs stay pinned at their
        // common level so the fixed point cannot spread them again.
        assigned.fill(false);
        for &i in &cyclic {
            assigned[i] = true;
        }
        for i in 0..count {
            if !assigned[i] && subgraphs[i].dependents.is_empty() {
                subgraphs[i].level = max_level;
                assigned[i] = true;
            }
        }
        changed = true;
        while changed {
            changed = false;
            for i in 0..count {
                if assigned[i] {
                    continue;
                }
                let mut min_dependent = i32::MAX;
                let mut ready = true;
                for &dep in &subgraphs[i].dependents {
                    if !assigned[dep] {
                        ready = false;
                        break;
                    }
                    min_dependent = min_dependent.min(subgraphs[dep].level);
                }
                if ready {
                    subgraphs[i].level = min_dependent - 1;
                    assigned[i] = true;
                    changed = true;
                }
            }
        }
        for i in 0..count {
            if !assigned[i] {
                subgraphs[i].level = 0;
            }
        }

        if let Some(workers) = num_workers {
            if workers > 0 {
                balance_levels(subgraphs, workers, max_level);
            }
        }
    }
}

/// Drops back-edges among the fixed-point leftovers so the runtime
/// dependency graph is acyclic. Forward edges inside the collapsed set are
/// kept; same-level ordering still flows through the dependency counters.
fn break_cycles(subgraphs: &mut [Subgraph], members: &[usize]) {
    let member_set: HashSet<usize> = members.iter().copied().collect();
    let mut state: HashMap<usize, u8> = HashMap::new(); // 1 = on stack, 2 = done
    let mut drops: Vec<(usize, usize)> = Vec::new();

    fn visit(
        node: usize,
        subgraphs: &[Subgraph],
        member_set: &HashSet<usize>,
        state: &mut HashMap<usize, u8>,
        drops: &mut Vec<(usize, usize)>,
    ) {
        state.insert(node, 1);
        for &next in &subgraphs[node].dependents {
            if !member_set.contains(&next) {
                continue;
            }
            match state.get(&next) {
                Some(1) => drops.push((node, next)),
                Some(_) => {}
                None => visit(next, subgraphs, member_set, state, drops),
            }
        }
        state.insert(node, 2);
    }

    for &member in members {
        if !state.contains_key(&member) {
            visit(member, subgraphs, &member_set, &mut state, &mut drops);
        }
    }

    for (from, to) in drops {
        subgraphs[from].dependents.retain(|d| *d != to);
        subgraphs[to].depends_on.retain(|d| *d != from);
    }
}

/// Worker-aware balancing: sweeping from the last level down, levels wider
/// than the worker count shed their highest-slack subgraphs to the previous
/// level. Level 0 is a fixed point.
fn balance_levels(subgraphs: &mut [Subgraph], workers: usize, max_level: i32) {
    for level in (1..=max_level).rev() {
        let indices: Vec<usize> = (0..subgraphs.len())
            .filter(|i| subgraphs[*i].level == level)
            .collect();
        if indices.len() <= workers {
            continue;
        }

        let mut slack: Vec<(usize, i32)> = indices
            .iter()
            .map(|&i| {
                let value = if subgraphs[i].depends_on.is_empty() {
                    subgraphs[i].level
                } else {
                    let max_dep = subgraphs[i]
                        .depends_on
                        .iter()
                        .map(|&dep| subgraphs[dep].level)
                        .max()
                        .unwrap_or(-1);
                    subgraphs[i].level - max_dep - 1
                };
                (i, value)
            })
            .collect();
        slack.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let excess = slack.len() - workers;
        for &(index, value) in slack.iter().take(excess) {
            if value > 0 {
                subgraphs[index].level = level - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(NodeId, NodeId)]) -> BTreeMap<NodeId, DagNode> {
        let mut nodes: BTreeMap<NodeId, DagNode> = BTreeMap::new();
        for &(from, to) in edges {
            nodes.entry(from).or_default();
            nodes.entry(to).or_default();
        }
        for &(from, to) in edges {
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
    }

    fn partition(
        edges: &[(NodeId, NodeId)],
        exclude: &[NodeId],
        workers: Option<usize>,
    ) -> Vec<Subgraph> {
        let nodes = graph(edges);
        let mut partitioner = DagPartitioner::new();
        let mut subgraphs = partitioner.extract_subgraphs(&nodes, exclude);
        partitioner.build_dependencies(&mut subgraphs, &nodes, workers);
        subgraphs
    }

    fn find<'a>(subgraphs: &'a [Subgraph], node: NodeId) -> &'a Subgraph {
        subgraphs
            .iter()
            .find(|sg| sg.node_ids.contains(&node))
            .expect("node must be scheduled")
    }

    // In(0) -> A(1) -> B(2) -> C(3) -> Out(4)
    #[test]
    fn linear_chain_collapses_to_one_subgraph() {
        let subgraphs = partition(&[(0, 1), (1, 2), (2, 3), (3, 4)], &[0, 4], None);
        assert_eq!(subgraphs.len(), 1);
        assert_eq!(subgraphs[0].node_ids, vec![1, 2, 3]);
        assert_eq!(subgraphs[0].level, 0);
        assert!(subgraphs[0].depends_on.is_empty());
    }

    // In(0) -> A(1) -> Out(3); In(0) -> B(2) -> Out(3)
    #[test]
    fn parallel_fan_yields_independent_subgraphs() {
        let subgraphs = partition(&[(0, 1), (0, 2), (1, 3), (2, 3)], &[0, 3], Some(2));
        assert_eq!(subgraphs.len(), 2);
        for sg in &subgraphs {
            assert_eq!(sg.level, 0);
            assert!(sg.depends_on.is_empty());
            assert!(sg.dependents.is_empty());
        }
    }

    // Fork-join: In(0)->A(1); A->B(2); A->C(3); B->D(4); C->D; D->Out(5)
    #[test]
    fn fork_join_levels_match_alap() {
        let subgraphs = partition(&[(0, 1), (1, 2), (1, 3), (2, 4), (3, 4), (4, 5)], &[0, 5], None);
        assert_eq!(subgraphs.len(), 4);
        assert_eq!(find(&subgraphs, 1).node_ids, vec![1]);
        assert_eq!(find(&subgraphs, 4).node_ids, vec![4]);
        assert_eq!(find(&subgraphs, 1).level, 0);
        assert_eq!(find(&subgraphs, 2).level, 1);
        assert_eq!(find(&subgraphs, 3).level, 1);
        assert_eq!(find(&subgraphs, 4).level, 2);
    }

    #[test]
    fn orphan_becomes_single_node_subgraph() {
        let nodes = {
            let mut nodes = graph(&[(0, 1), (1, 2)]);
            nodes.entry(9).or_default();
            nodes
        };
        let mut partitioner = DagPartitioner::new();
        let subgraphs = partitioner.extract_subgraphs(&nodes, &[0, 2]);
        assert!(subgraphs.iter().any(|sg| sg.node_ids == vec![9]));
    }

    #[test]
    fn every_node_scheduled_exactly_once() {
        let edges = [(0, 1), (1, 2), (1, 3), (3, 4), (2, 5), (4, 5), (5, 6)];
        let subgraphs = partition(&edges, &[0, 6], None);
        let mut seen = HashSet::new();
        for sg in &subgraphs {
            for id in &sg.node_ids {
                assert!(seen.insert(*id), "node {id} scheduled twice");
            }
        }
        assert_eq!(seen, HashSet::from([1, 2, 3, 4, 5]));
    }

    #[test]
    fn cross_subgraph_edges_respect_levels() {
        let edges = [(0, 1), (1, 2), (1, 3), (3, 4), (2, 5), (4, 5), (5, 6)];
        let nodes = graph(&edges);
        let subgraphs = partition(&edges, &[0, 6], None);
        let owner: HashMap<NodeId, usize> = subgraphs
            .iter()
            .enumerate()
            .flat_map(|(i, sg)| sg.node_ids.iter().map(move |id| (*id, i)))
            .collect();
        for (id, node) in &nodes {
            let Some(&from) = owner.get(id) else { continue };
            for out in &node.outputs_to {
                let Some(&to) = owner.get(out) else { continue };
                if from != to {
                    assert!(
                        subgraphs[to].level > subgraphs[from].level,
                        "edge {id}->{out} violates level order"
                    );
                }
            }
        }
    }

    #[test]
    fn cycle_collapses_to_common_level_without_deadlocking_deps() {
        // 1 -> 2 -> 3 -> 1 feedback, plus 3 -> 4 -> out.
        let edges = [(0, 1), (1, 2), (2, 3), (3, 1), (3, 4), (4, 5)];
        let subgraphs = partition(&edges, &[0, 5], None);

        // Runtime dependency graph must be acyclic: a topological walk
        // over depends_on must terminate.
        let mut remaining: Vec<usize> = (0..subgraphs.len()).collect();
        let mut done: HashSet<usize> = HashSet::new();
        let mut progressed = true;
        while progressed && !remaining.is_empty() {
            progressed = false;
            remaining.retain(|&i| {
                if subgraphs[i].depends_on.iter().all(|d| done.contains(d)) {
                    done.insert(i);
                    progressed = true;
                    false
                } else {
                    true
                }
            });
        }
        assert!(remaining.is_empty(), "cyclic runtime dependencies remain");

        // Cycle members share a level.
        let l1 = find(&subgraphs, 1).level;
        let l2 = find(&subgraphs, 2).level;
        let l3 = find(&subgraphs, 3).level;
        assert_eq!(l1, l2);
        assert_eq!(l2, l3);
    }

    #[test]
    fn load_balancing_pulls_slack_to_earlier_levels() {
        // A(1), B(2) feed join J1(3); J1, C(4), D(5) feed join J2(6).
        // ALAP stacks J1, C, and D at level 1; with two workers one of the
        // slack-bearing sources gets pulled down to level 0.
        let edges = [
            (0, 1),
            (0, 2),
            (1, 3),
            (2, 3),
            (3, 6),
            (0, 4),
            (4, 6),
            (0, 5),
            (5, 6),
            (6, 7),
        ];
        let unbalanced = partition(&edges, &[0, 7], None);
        assert_eq!(find(&unbalanced, 3).level, 1);
        assert_eq!(find(&unbalanced, 4).level, 1);
        assert_eq!(find(&unbalanced, 5).level, 1);

        let balanced = partition(&edges, &[0, 7], Some(2));
        let level_one = balanced.iter().filter(|sg| sg.level == 1).count();
        assert!(level_one <= 2, "level 1 still holds {level_one} subgraphs");
        // J1 has zero slack (its deps sit at level 0) so it stays put.
        assert_eq!(find(&balanced, 3).level, 1);
        // Dependencies still respected after balancing.
        for sg in &balanced {
            for &dep in &sg.depends_on {
                assert!(balanced[dep].level <= sg.level);
            }
        }
    }
}
