//! Rolling bytes/sec counter for `Socket::get_recv_speed`/`get_send_speed`.
//!
//! Grounded on `BytesSpeed` in `original_source/src/util/speed_statistic.h`:
//! accumulate bytes, recompute the rate once either a second has passed or
//! the running total crosses 1 MiB (so a connection pushing data in a tight
//! loop doesn't wait a full second for its first reading).

use std::time::{Duration, Instant};

const RECOMPUTE_THRESHOLD: u64 = 1024 * 1024;

pub struct BytesSpeed {
    bytes: u64,
    speed: u64,
    since: Instant,
}

impl Default for BytesSpeed {
    fn default() -> BytesSpeed {
        BytesSpeed {
            bytes: 0,
            speed: 0,
            since: Instant::now(),
        }
    }
}

impl BytesSpeed {
    pub fn add(&mut self, n: u64) {
        self.bytes += n;
        if self.bytes > RECOMPUTE_THRESHOLD {
            self.recompute();
        }
    }

    pub fn speed(&mut self) -> u64 {
        if self.since.elapsed() < Duration::from_millis(1000) {
            return self.speed;
        }
        self.recompute()
    }

    fn recompute(&mut self) -> u64 {
        let elapsed_ms = self.since.elapsed().as_millis() as u64;
        if elapsed_ms == 0 {
            return self.speed;
        }
        self.speed = self.bytes * 1000 / elapsed_ms;
        self.since = Instant::now();
        self.bytes = 0;
        self.speed
    }
}
