/// Worker placement for the realtime pool.
#[derive(Clone, Debug)]
pub struct PoolTopology {
    /// Worker threads spawned alongside the producing thread.
    pub workers: u32,
    /// Pin each worker to its own core. Core 0 is left to the host
    /// callback thread.
    pub pin_workers: bool,
}

impl Default for PoolTopology {
    fn default() -> Self {
        let workers = num_cpus::get_physical().saturating_sub(1).max(1);
        Self {
            workers: workers as u32,
            pin_workers: true,
        }
    }
}

/// Core assignment for worker `index`: the cores after 0, wrapping on
/// machines with fewer cores than workers. `None` when pinning is off or
/// there is no core to spare.
pub fn worker_core(topology: &PoolTopology, index: usize) -> Option<usize> {
    if !topology.pin_workers {
        return None;
    }
    let total = num_cpus::get().max(1);
    if total < 2 {
        return None;
    }
    Some(1 + index % (total - 1))
}

/// Enables flush-to-zero and denormals-are-zero on supported CPUs.
#[inline]
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn enable_ftz_daz() {
    unsafe {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::{_mm_getcsr, _mm_setcsr};
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};

        const FTZ: u32 = 1 << 15;
        const DAZ: u32 = 1 << 6;
        let csr = _mm_getcsr();
        _mm_setcsr(csr | FTZ | DAZ);
    }
}

/// No-op implementation for non x86/x86_64 targets.
#[inline]
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn enable_ftz_daz() {}

/// Pins the current process's address space into RAM to avoid major page
/// faults during realtime processing. On platforms where this is not
/// supported the call becomes a no-op.
#[cfg(target_os = "linux")]
pub fn mlock_process() -> std::io::Result<()> {
    unsafe {
        let flags = libc::MCL_CURRENT | libc::MCL_FUTURE;
        if libc::mlockall(flags) != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                // Insufficient permissions; running unlocked is acceptable.
                return Ok(());
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mlock_process() -> std::io::Result<()> {
    Ok(())
}

/// Attempts SCHED_FIFO promotion for the current thread, falling back to
/// normal scheduling silently when the platform or permissions refuse.
pub fn promote_current_thread_to_realtime() {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{sched_param, sched_setscheduler, SCHED_FIFO};
        let param = sched_param { sched_priority: 70 };
        let _ = sched_setscheduler(0, SCHED_FIFO, &param);
    }
}

/// Pins the current thread to the given logical core where affinity
/// management is available; otherwise succeeds without changes.
#[allow(unused_variables)]
pub fn pin_current_thread_to(core: usize) {
    #[cfg(feature = "core_affinity")]
    if let Some(ids) = core_affinity::get_core_ids() {
        if let Some(id) = ids.into_iter().nth(core) {
            let _ = core_affinity::set_for_current(id);
        }
    }
}
