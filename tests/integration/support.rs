//! Shared helpers.

use std::thread;
use std::time::{Duration, Instant};

use tickrt::{ClockMode, ParallelConfig};

pub fn config(workers: usize) -> ParallelConfig {
    ParallelConfig {
        workers,
        spin_iters: 32,
        park_timeout: Duration::from_micros(100),
        io_threads: 1,
        ..ParallelConfig::default()
    }
}

pub fn realtime(workers: usize) -> ParallelConfig {
    ParallelConfig {
        mode: ClockMode::RealTime,
        ..config(workers)
    }
}

/// Poll `cond` for up to five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}
