use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// Snapshot of a device callback's timing health.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackMetrics {
    pub xruns: u64,
    pub last_block_ns: u64,
    pub max_block_ns: u64,
}

/// Lock-free collector fed by a realtime callback and drained from control
/// threads. The history ring is bounded; old entries are overwritten.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    xruns: AtomicU64,
    last_block_ns: AtomicU64,
    max_block_ns: AtomicU64,
    history: ArrayQueue<CallbackMetrics>,
}

impl MetricsCollector {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                xruns: AtomicU64::new(0),
                last_block_ns: AtomicU64::new(0),
                max_block_ns: AtomicU64::new(0),
                history: ArrayQueue::new(history_capacity.max(16)),
            }),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> CallbackMetrics {
        CallbackMetrics {
            xruns: self.inner.xruns.load(Ordering::Relaxed),
            last_block_ns: self.inner.last_block_ns.load(Ordering::Relaxed),
            max_block_ns: self.inner.max_block_ns.load(Ordering::Relaxed),
        }
    }

    /// Records one block's duration; counts an xrun when it overran the
    /// callback period.
    #[inline]
    pub fn record_block(&self, duration: Duration, period_ns: u64) {
        let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.inner.last_block_ns.store(nanos, Ordering::Relaxed);
        let max_ns = self.inner.update_max(nanos);
        let xruns = if period_ns > 0 && nanos > period_ns {
            self.inner.xruns.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.inner.xruns.load(Ordering::Relaxed)
        };
        self.inner.push_history(CallbackMetrics {
            xruns,
            last_block_ns: nanos,
            max_block_ns: max_ns.max(nanos),
        });
    }

    #[inline]
    pub fn register_xrun(&self) {
        let xruns = self.inner.xruns.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.push_history(CallbackMetrics {
            xruns,
            last_block_ns: self.inner.last_block_ns.load(Ordering::Relaxed),
            max_block_ns: self.inner.max_block_ns.load(Ordering::Relaxed),
        });
    }

    pub fn drain_history(&self) -> Vec<CallbackMetrics> {
        let mut out = Vec::new();
        while let Some(entry) = self.inner.history.pop() {
            out.push(entry);
        }
        out
    }

    pub fn reset(&self) {
        self.inner.xruns.store(0, Ordering::Relaxed);
        self.inner.last_block_ns.store(0, Ordering::Relaxed);
        self.inner.max_block_ns.store(0, Ordering::Relaxed);
        while self.inner.history.pop().is_some() {}
    }
}

impl MetricsInner {
    #[inline]
    fn push_history(&self, metrics: CallbackMetrics) {
        if self.history.push(metrics).is_err() {
            let _ = self.history.pop();
            let _ = self.history.push(metrics);
        }
    }

    #[inline]
    fn update_max(&self, candidate: u64) -> u64 {
        let mut current = self.max_block_ns.load(Ordering::Relaxed);
        while candidate > current {
            match self.max_block_ns.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(previous) => current = previous,
            }
        }
        current
    }
}
