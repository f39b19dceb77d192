//! The process-wide set of `EventPoller`s servers and clients run on.
//!
//! Grounded on `EventPollerPool`/`TaskExecutorGetterImp` in
//! `original_source/ZLToolKit/src/Poller/EventPoller.h` (`.cpp`): one
//! poller per CPU by default, chosen round-robin-by-load rather than
//! strictly round robin, with an escape hatch that prefers whatever poller
//! the calling thread is already bound to (avoids a socket migrating
//! threads just because its creator happened to call in from a poller
//! thread).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use super::event_poller::EventPoller;

static POOL_SIZE: AtomicUsize = AtomicUsize::new(0);
static CPU_AFFINITY: AtomicBool = AtomicBool::new(true);
static PREFER_CURRENT_THREAD_DEFAULT: AtomicBool = AtomicBool::new(true);

/// Must be called before the first [`PollerPool::instance`] call to have
/// any effect, matching the original's "must be called before the
/// singleton is constructed" contract. `0` means one poller per CPU.
pub fn set_pool_size(size: usize) {
    POOL_SIZE.store(size, Ordering::SeqCst);
}

pub fn enable_cpu_affinity(enable: bool) {
    CPU_AFFINITY.store(enable, Ordering::SeqCst);
}

pub struct PollerPool {
    pollers: Vec<Arc<EventPoller>>,
    next: AtomicUsize,
    prefer_current_thread: AtomicBool,
}

impl PollerPool {
    pub fn instance() -> &'static PollerPool {
        static INSTANCE: OnceLock<PollerPool> = OnceLock::new();
        INSTANCE.get_or_init(PollerPool::new)
    }

    fn new() -> PollerPool {
        let configured = POOL_SIZE.load(Ordering::SeqCst);
        let size = if configured == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            configured
        };
        let affinity = CPU_AFFINITY.load(Ordering::SeqCst);

        let mut pollers = Vec::with_capacity(size);
        for i in 0..size {
            let poller = EventPoller::new(format!("event poller {i}"))
                .expect("failed to create event poller");
            if affinity {
                poller.set_cpu_affinity(Some(i));
            }
            poller.run(false, true).expect("failed to start event poller thread");
            pollers.push(poller);
        }
        log::info!("event poller pool created, size: {size}");

        PollerPool {
            pollers,
            next: AtomicUsize::new(0),
            prefer_current_thread: AtomicBool::new(PREFER_CURRENT_THREAD_DEFAULT.load(Ordering::SeqCst)),
        }
    }

    pub fn get_first_poller(&self) -> Arc<EventPoller> {
        self.pollers[0].clone()
    }

    /// Picks the least-loaded poller, unless `prefer_current_thread` (both
    /// the argument and the pool-wide setting) applies and the calling
    /// thread is already one of this pool's poller threads.
    pub fn get_poller(&self, prefer_current_thread: bool) -> Arc<EventPoller> {
        if prefer_current_thread && self.prefer_current_thread.load(Ordering::SeqCst) {
            if let Some(current) = EventPoller::get_current_poller() {
                return current;
            }
        }
        self.pollers
            .iter()
            .min_by_key(|p| p.load())
            .cloned()
            .unwrap_or_else(|| self.get_first_poller())
    }

    /// Strict round robin, for callers that want even distribution
    /// regardless of instantaneous load (bulk socket construction, per the
    /// original's note on `preferCurrentThread`).
    pub fn get_poller_round_robin(&self) -> Arc<EventPoller> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.pollers.len();
        self.pollers[idx].clone()
    }

    pub fn prefer_current_thread(&self, flag: bool) {
        self.prefer_current_thread.store(flag, Ordering::SeqCst);
    }

    pub fn size(&self) -> usize {
        self.pollers.len()
    }

    pub fn loads(&self) -> Vec<u32> {
        self.pollers.iter().map(|p| p.load()).collect()
    }

    /// Every poller in the pool, for callers (a multi-poller `TcpServer`)
    /// that need to fan a listener out across all of them rather than
    /// picking just one. Grounded on `TaskExecutorGetterImp::for_each`.
    pub fn all(&self) -> Vec<Arc<EventPoller>> {
        self.pollers.clone()
    }
}
