use std::sync::atomic::{
    AtomicBool, AtomicU32,
    Ordering::{Acquire, Release, SeqCst},
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crosswire_rt::cpu;
use crosswire_rt::{AdaptiveSpinWait, PoolTopology};

use crate::task_graph::DependencyTaskGraph;

/// One prepared block schedule as seen by the worker pool.
///
/// `run_task` must be safe to call concurrently for distinct indices; the
/// claim discipline of the task graph guarantees each index runs on
/// exactly one thread per block.
pub trait BlockWork: Send + Sync {
    fn task_graph(&self) -> &DependencyTaskGraph;
    fn run_task(&self, index: usize);
}

/// Sized holder so the schedule handle fits an atomic pointer slot.
struct WorkHolder(Arc<dyn BlockWork>);

struct PoolInner {
    work: ArcSwapOption<WorkHolder>,
    has_work: AtomicBool,
    stop: AtomicBool,
    active_workers: AtomicU32,
}

/// Pinned high-priority worker pool driving one block of the subgraph DAG.
///
/// Workers idle on a spin/yield/sleep ladder and never make a syscall while
/// a block is in flight. The producing thread participates in execution and
/// returns only after every worker has drained out of the block, so the
/// next block's task-graph reset cannot race a straggler.
pub struct RealtimeThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<JoinHandle<()>>,
}

impl RealtimeThreadPool {
    pub fn new(topology: &PoolTopology) -> Self {
        let inner = Arc::new(PoolInner {
            work: ArcSwapOption::const_empty(),
            has_work: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            active_workers: AtomicU32::new(0),
        });

        if let Err(err) = cpu::mlock_process() {
            tracing::warn!(%err, "could not lock process memory for realtime use");
        }

        let mut handles = Vec::new();
        for index in 0..topology.workers as usize {
            let core = cpu::worker_core(topology, index);
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("cw-wkr-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        cpu::pin_current_thread_to(core);
                    }
                    cpu::promote_current_thread_to_realtime();
                    cpu::enable_ftz_daz();
                    worker_loop(inner);
                })
                .expect("failed to spawn graph worker thread");
            handles.push(handle);
        }

        Self {
            inner,
            workers: handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Publishes the schedule workers execute. Called at prepare time, off
    /// the realtime thread.
    pub fn install(&self, work: Arc<dyn BlockWork>) {
        self.inner.work.store(Some(Arc::new(WorkHolder(work))));
    }

    pub fn clear_work(&self) {
        self.inner.work.store(None);
    }

    /// Drives one block to completion. The caller is the producer thread
    /// and executes tasks alongside the workers.
    pub fn run_block(&self, spin: &AdaptiveSpinWait) {
        let guard = self.inner.work.load();
        let Some(holder) = guard.as_ref() else {
            return;
        };
        let work: &dyn BlockWork = holder.0.as_ref();
        let tasks = work.task_graph();
        if tasks.is_empty() {
            return;
        }

        // Safe: the previous run_block drained all workers before returning.
        tasks.reset();
        self.inner.has_work.store(true, SeqCst);

        loop {
            if let Some(index) = tasks.claim_next() {
                work.run_task(index);
                tasks.mark_complete(index);
                continue;
            }
            if tasks.all_done() {
                break;
            }
            // Everything runnable is claimed by workers; spin until a
            // dependency resolves or the block drains.
            spin.wait(|| tasks.all_done() || tasks.has_ready());
        }

        self.inner.has_work.store(false, SeqCst);
        spin.wait(|| self.inner.active_workers.load(SeqCst) == 0);
    }
}

impl Drop for RealtimeThreadPool {
    fn drop(&mut self) {
        self.inner.stop.store(true, Release);
        self.inner.has_work.store(true, SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(pool: Arc<PoolInner>) {
    let mut idle_spins = 0u32;
    loop {
        if pool.stop.load(Acquire) {
            break;
        }
        if !pool.has_work.load(SeqCst) {
            if idle_spins < 500 {
                core::hint::spin_loop();
                idle_spins = idle_spins.saturating_add(1);
            } else if idle_spins < 2000 {
                thread::yield_now();
                idle_spins = idle_spins.saturating_add(1);
            } else {
                thread::sleep(Duration::from_micros(200));
                idle_spins = 0;
            }
            continue;
        }
        idle_spins = 0;

        // Announce before re-checking: the producer's end-of-block drain
        // waits on this counter, so a worker that slips in late either
        // sees the flag lowered and bails or is waited for.
        pool.active_workers.fetch_add(1, SeqCst);
        if pool.has_work.load(SeqCst) {
            let guard = pool.work.load();
            if let Some(holder) = guard.as_ref() {
                let work: &dyn BlockWork = holder.0.as_ref();
                let tasks = work.task_graph();
                while pool.has_work.load(Acquire) {
                    if let Some(index) = tasks.claim_next() {
                        work.run_task(index);
                        tasks.mark_complete(index);
                    } else if tasks.all_done() {
                        break;
                    } else {
                        core::hint::spin_loop();
                    }
                }
            }
        }
        pool.active_workers.fetch_sub(1, SeqCst);

        // Park until the producer lowers the flag for this block.
        while pool.has_work.load(Acquire) && !pool.stop.load(Acquire) {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ChainSpec;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingWork {
        tasks: DependencyTaskGraph,
        order: Mutex<Vec<usize>>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl RecordingWork {
        fn new(deps: &[&[usize]]) -> Self {
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
            Self {
                tasks: DependencyTaskGraph::build(&specs),
                order: Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    impl BlockWork for RecordingWork {
        fn task_graph(&self) -> &DependencyTaskGraph {
            &self.tasks
        }

        fn run_task(&self, index: usize) {
            let now = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_concurrent.fetch_max(now, Ordering::AcqRel);
            std::thread::sleep(Duration::from_micros(200));
            self.order.lock().unwrap().push(index);
            self.concurrent.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn topology(workers: u32) -> PoolTopology {
        PoolTopology {
            workers,
            pin_workers: false,
        }
    }

    #[test]
    fn serial_pool_runs_every_task() {
        let pool = RealtimeThreadPool::new(&topology(0));
        assert_eq!(pool.worker_count(), 0);
        let work = Arc::new(RecordingWork::new(&[&[], &[0], &[1]]));
        pool.install(Arc::clone(&work) as Arc<dyn BlockWork>);
        pool.run_block(&AdaptiveSpinWait::default());
        assert_eq!(*work.order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn dependencies_hold_across_workers() {
        let pool = RealtimeThreadPool::new(&topology(2));
        // Diamond: 0 -> {1, 2} -> 3.
        let work = Arc::new(RecordingWork::new(&[&[], &[0], &[0], &[1, 2]]));
        pool.install(Arc::clone(&work) as Arc<dyn BlockWork>);

        for _ in 0..50 {
            work.order.lock().unwrap().clear();
            pool.run_block(&AdaptiveSpinWait::default());
            let order = work.order.lock().unwrap().clone();
            assert_eq!(order.len(), 4);
            let position = |task: usize| order.iter().position(|t| *t == task).unwrap();
            assert!(position(0) < position(1));
            assert!(position(0) < position(2));
            assert!(position(3) > position(1));
            assert!(position(3) > position(2));
            let unique: HashSet<usize> = order.iter().copied().collect();
            assert_eq!(unique.len(), 4, "task ran twice: {order:?}");
        }
    }

    #[test]
    fn independent_tasks_overlap_with_workers() {
        let pool = RealtimeThreadPool::new(&topology(3));
        let work = Arc::new(RecordingWork::new(&[&[], &[], &[], &[]]));
        pool.install(Arc::clone(&work) as Arc<dyn BlockWork>);
        for _ in 0..20 {
            pool.run_block(&AdaptiveSpinWait::default());
            if work.max_concurrent.load(Ordering::Acquire) >= 2 {
                return;
            }
        }
        // Machine may be single-core in CI; overlap is opportunistic, but
        // every task must still have run.
        assert_eq!(work.order.lock().unwrap().len(), 20 * 4);
    }
}
