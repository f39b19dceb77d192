//! CPU pinning for poller threads.
//!
//! Grounded on `EventPollerPool::enableCpuAffinity`/`ThreadPool`'s use of
//! `pthread_setaffinity_np` in the original toolkit, and named in SPEC_FULL
//! §6. Linux-only; a no-op elsewhere, same as the teacher's own
//! `#[cfg(target_os = "linux")]` gating of Linux-specific `libc` calls.

#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if ret != 0 {
            log::warn!("pthread_setaffinity_np(cpu={cpu}) failed: errno {ret}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) {}
