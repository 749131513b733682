use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Spin budget strategy for [`AdaptiveSpinWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinMode {
    /// Exponential backoff, 8 pauses doubling up to 8192, then OS yields.
    FixedBackoff,
    /// Like `FixedBackoff`, but the iteration ceiling is derived from a
    /// one-time pause-latency benchmark so the total spin stays under half
    /// the audio block period.
    Benchmarked,
}

const BASE_PAUSES: u32 = 8;
const FIXED_MAX_ITERATIONS: u32 = 10;

/// Bounded busy-wait usable from a realtime audio thread.
///
/// Iteration `i` issues `8 << i` CPU pause hints; once the iteration ceiling
/// is reached every further round yields to the scheduler so a stalled
/// predicate cannot starve the host callback.
#[derive(Debug, Clone)]
pub struct AdaptiveSpinWait {
    mode: SpinMode,
    max_iterations: u32,
}

impl Default for AdaptiveSpinWait {
    fn default() -> Self {
        Self::new(SpinMode::FixedBackoff)
    }
}

impl AdaptiveSpinWait {
    pub fn new(mode: SpinMode) -> Self {
        Self {
            mode,
            max_iterations: FIXED_MAX_ITERATIONS,
        }
    }

    /// Derives the iteration ceiling for the current block settings. In
    /// `Benchmarked` mode the budget is half the block period; in
    /// `FixedBackoff` mode this is a no-op.
    pub fn configure(&mut self, block_size: usize, sample_rate: f64) {
        if self.mode != SpinMode::Benchmarked || sample_rate <= 0.0 {
            return;
        }
        let block_seconds = block_size as f64 / sample_rate;
        let budget_ns = block_seconds * 0.5 * 1e9;
        self.max_iterations = iterations_within(budget_ns).max(1);
    }

    /// Spins until `predicate` returns true.
    pub fn wait<F>(&self, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        let mut iteration = 0u32;
        while !predicate() {
            if iteration >= self.max_iterations {
                std::thread::yield_now();
            } else {
                pause_cycles(BASE_PAUSES << iteration);
                iteration += 1;
            }
        }
    }

    /// Spins until the flag holds `expected` (acquire load).
    pub fn wait_for_flag(&self, flag: &AtomicBool, expected: bool) {
        self.wait(|| flag.load(Ordering::Acquire) == expected);
    }
}

#[inline]
fn pause_cycles(count: u32) {
    for _ in 0..count {
        core::hint::spin_loop();
    }
}

/// Average nanoseconds per pause hint, measured once per process.
fn avg_pause_ns() -> f64 {
    static MEASURED: OnceLock<f64> = OnceLock::new();
    *MEASURED.get_or_init(|| {
        let handle = std::thread::Builder::new()
            .name("cw-spin-bench".into())
            .spawn(|| {
                crate::cpu::promote_current_thread_to_realtime();
                benchmark_pause_ns()
            });
        match handle {
            Ok(handle) => handle.join().unwrap_or(1.0),
            Err(_) => benchmark_pause_ns(),
        }
    })
}

fn benchmark_pause_ns() -> f64 {
    const ROUNDS: u32 = 3;
    let mut total_pauses = 0u64;
    let start = Instant::now();
    for _ in 0..ROUNDS {
        for iteration in 0..FIXED_MAX_ITERATIONS {
            let count = BASE_PAUSES << iteration;
            pause_cycles(count);
            total_pauses += count as u64;
        }
    }
    let elapsed = start.elapsed().as_nanos() as f64;
    (elapsed / total_pauses.max(1) as f64).max(1.0)
}

fn iterations_within(budget_ns: f64) -> u32 {
    let pause_ns = avg_pause_ns();
    let mut cumulative = 0.0;
    let mut iteration = 0u32;
    while iteration < 32 {
        let step = (BASE_PAUSES << iteration) as f64 * pause_ns;
        if cumulative + step > budget_ns {
            break;
        }
        cumulative += step;
        iteration += 1;
    }
    iteration
}
