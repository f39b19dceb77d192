//! Per-poller CPU load estimate.
//!
//! Grounded on `ThreadLoadCounter` in `ZLToolKit/src/Thread/TaskExecutor.h`/
//! `.cpp`: a ring buffer of (duration, was-sleeping) samples, capped by both
//! a sample count and a time window, used to derive a 0-100 busy ratio.
//! `EventPoller::run` calls [`LoadCounter::start_sleep`] right before
//! blocking in the selector and [`LoadCounter::wake_up`] right after, and
//! `PollerPool::get_poller` reads [`LoadCounter::load`] to pick the least
//! busy poller.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

struct Sample {
    micros: u64,
    sleeping: bool,
}

struct Inner {
    sleeping: bool,
    last_sleep: Instant,
    last_wake: Instant,
    samples: VecDeque<Sample>,
}

/// Tracks how much of the last `max_usec` microseconds (bounded to at most
/// `max_size` samples) a poller thread spent blocked in the selector versus
/// running task/event callbacks.
pub struct LoadCounter {
    max_size: usize,
    max_usec: u64,
    inner: Mutex<Inner>,
}

impl LoadCounter {
    pub fn new(max_size: usize, max_usec: u64) -> Self {
        let now = Instant::now();
        LoadCounter {
            max_size,
            max_usec,
            inner: Mutex::new(Inner {
                sleeping: true,
                last_sleep: now,
                last_wake: now,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Called right before the thread blocks in the selector.
    pub fn start_sleep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let run_time = now.duration_since(inner.last_wake).as_micros() as u64;
        inner.sleeping = true;
        inner.last_sleep = now;
        push(&mut inner.samples, self.max_size, run_time, false);
    }

    /// Called right after the thread wakes from the selector.
    pub fn wake_up(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let sleep_time = now.duration_since(inner.last_sleep).as_micros() as u64;
        inner.sleeping = false;
        inner.last_wake = now;
        push(&mut inner.samples, self.max_size, sleep_time, true);
    }

    /// Busy ratio in `0..=100`.
    pub fn load(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut total_sleep: u64 = inner.samples.iter().filter(|s| s.sleeping).map(|s| s.micros).sum();
        let mut total_run: u64 = inner.samples.iter().filter(|s| !s.sleeping).map(|s| s.micros).sum();

        if inner.sleeping {
            total_sleep += now.duration_since(inner.last_sleep).as_micros() as u64;
        } else {
            total_run += now.duration_since(inner.last_wake).as_micros() as u64;
        }

        let max_usec = self.max_usec;
        let max_size = self.max_size;
        let mut total = total_run + total_sleep;
        while !inner.samples.is_empty() && (total > max_usec || inner.samples.len() > max_size) {
            let front = inner.samples.pop_front().unwrap();
            if front.sleeping {
                total_sleep -= front.micros;
            } else {
                total_run -= front.micros;
            }
            total -= front.micros;
        }

        if total == 0 {
            0
        } else {
            (total_run * 100 / total) as u32
        }
    }
}

fn push(samples: &mut VecDeque<Sample>, max_size: usize, micros: u64, sleeping: bool) {
    samples.push_back(Sample { micros, sleeping });
    if samples.len() > max_size {
        samples.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_thread_reports_zero_load() {
        let counter = LoadCounter::new(32, 2_000_000);
        counter.start_sleep();
        counter.wake_up();
        assert!(counter.load() <= 100);
    }

    #[test]
    fn caps_sample_count() {
        let counter = LoadCounter::new(4, 2_000_000);
        for _ in 0..10 {
            counter.start_sleep();
            counter.wake_up();
        }
        let inner = counter.inner.lock().unwrap();
        assert!(inner.samples.len() <= 4);
    }
}
