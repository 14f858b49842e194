//! Thread-local worker identity.
//!
//! Worker threads record `(runtime, worker)` at startup so that:
//! - pools route releases to the worker's local cache,
//! - `exec_wait` can run inline instead of deadlocking on its own inbox.
//!
//! Several runtimes may live in one process (tests do this), so the runtime
//! id is part of the identity. Non-worker threads see `None`.

use std::cell::Cell;

/// Identity of the worker running on the current thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerTag {
    pub runtime: u64,
    pub worker: usize,
}

thread_local! {
    static CURRENT: Cell<Option<WorkerTag>> = const { Cell::new(None) };
}

/// Set (or clear) the worker identity of this thread.
///
/// Workers call this once at startup with `Some` and once before exit with
/// `None`.
#[inline]
pub fn set_current_worker(tag: Option<WorkerTag>) {
    CURRENT.with(|c| c.set(tag));
}

/// Worker identity of this thread, if it is a runtime worker.
#[inline]
pub fn current_worker() -> Option<WorkerTag> {
    CURRENT.with(Cell::get)
}

/// Worker index on this thread when it belongs to `runtime`.
#[inline]
pub fn current_worker_in(runtime: u64) -> Option<usize> {
    current_worker()
        .filter(|t| t.runtime == runtime)
        .map(|t| t.worker)
}
