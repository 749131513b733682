use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::extractor::ChainSpec;

/// Runtime state for one scheduled execution of the subgraph DAG.
///
/// Entries are reset at the start of every block and mutated only by the
/// workers running that block. A task becomes claimable once its pending
/// dependency counter hits zero; completion releases every effect of the
/// task to whoever acquires the `completed` flag.
pub struct DependencyTaskGraph {
    entries: Vec<TaskEntry>,
    dependents: Vec<Vec<usize>>,
    completed_count: AtomicUsize,
}

struct TaskEntry {
    initial_deps: u32,
    pending_deps: AtomicU32,
    claimed: AtomicBool,
    completed: AtomicBool,
}

impl DependencyTaskGraph {
    pub fn build(chains: &[ChainSpec]) -> Self {
        let entries = chains
            .iter()
            .map(|chain| TaskEntry {
                initial_deps: chain.depends_on.len() as u32,
                pending_deps: AtomicU32::new(chain.depends_on.len() as u32),
                claimed: AtomicBool::new(false),
                completed: AtomicBool::new(false),
            })
            .collect();
        let dependents = chains.iter().map(|chain| chain.dependents.clone()).collect();
        Self {
            entries,
            dependents,
            completed_count: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rearms every entry for a new block. Callers must guarantee no worker
    /// is still executing the previous block.
    pub fn reset(&self) {
        for entry in &self.entries {
            entry.pending_deps.store(entry.initial_deps, Ordering::Relaxed);
            entry.claimed.store(false, Ordering::Relaxed);
            entry.completed.store(false, Ordering::Relaxed);
        }
        self.completed_count.store(0, Ordering::Release);
    }

    /// Scans for a ready task and claims it. Returns the claimed index.
    pub fn claim_next(&self) -> Option<usize> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.pending_deps.load(Ordering::Acquire) != 0 {
                continue;
            }
            if entry.completed.load(Ordering::Acquire) {
                continue;
            }
            if entry
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(index);
            }
        }
        None
    }

    /// Marks a claimed task finished and unblocks its dependents.
    pub fn mark_complete(&self, index: usize) {
        self.entries[index].completed.store(true, Ordering::Release);
        for &dependent in &self.dependents[index] {
            self.entries[dependent]
                .pending_deps
                .fetch_sub(1, Ordering::AcqRel);
        }
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    /// True when some task is claimable right now. Unlike
    /// [`DependencyTaskGraph::claim_next`] this takes nothing.
    pub fn has_ready(&self) -> bool {
        self.entries.iter().any(|entry| {
            entry.pending_deps.load(Ordering::Acquire) == 0
                && !entry.claimed.load(Ordering::Acquire)
                && !entry.completed.load(Ordering::Acquire)
        })
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.entries[index].completed.load(Ordering::Acquire)
    }

    pub fn all_done(&self) -> bool {
        self.completed_count.load(Ordering::Acquire) == self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chains(deps: &[&[usize]]) -> Vec<ChainSpec> {
        let mut specs: Vec<ChainSpec> = deps
            .iter()
            .map(|d| ChainSpec {
                depends_on: d.to_vec(),
                ..ChainSpec::default()
            })
            .collect();
        for i in 0..specs.len() {
            let depends = specs[i].depends_on.clone();
            for dep in depends {
                specs[dep].dependents.push(i);
            }
        }
        specs
    }

    #[test]
    fn dependents_unblock_in_order() {
        // 0 -> 1 -> 2
        let graph = DependencyTaskGraph::build(&chains(&[&[], &[0], &[1]]));
        graph.reset();

        assert_eq!(graph.claim_next(), Some(0));
        assert_eq!(graph.claim_next(), None);
        graph.mark_complete(0);

        assert_eq!(graph.claim_next(), Some(1));
        graph.mark_complete(1);
        assert_eq!(graph.claim_next(), Some(2));
        graph.mark_complete(2);

        assert!(graph.all_done());
    }

    #[test]
    fn join_waits_for_both_branches() {
        // 0 and 1 feed 2.
        let graph = DependencyTaskGraph::build(&chains(&[&[], &[], &[0, 1]]));
        graph.reset();

        let a = graph.claim_next().unwrap();
        let b = graph.claim_next().unwrap();
        assert_eq!(graph.claim_next(), None);
        graph.mark_complete(a);
        assert_eq!(graph.claim_next(), None);
        graph.mark_complete(b);
        assert_eq!(graph.claim_next(), Some(2));
    }

    #[test]
    fn reset_rearms_all_entries() {
        let graph = DependencyTaskGraph::build(&chains(&[&[], &[0]]));
        graph.reset();
        graph.mark_complete(graph.claim_next().unwrap());
        graph.mark_complete(graph.claim_next().unwrap());
        assert!(graph.all_done());

        graph.reset();
        assert!(!graph.all_done());
        assert_eq!(graph.claim_next(), Some(0));
    }
}
