//! Bounded queues between work units.
//!
//! Queues are the sanctioned channel for one unit to hand data to another.
//! Every queue is bounded; what happens on a full queue is fixed per queue
//! by its [`OverflowPolicy`] and never silently drops or reorders:
//!
//! | Kind             | Type                 | Producers | Full queue |
//! |------------------|----------------------|-----------|------------|
//! | `TickQueue`      | `SpscQueue<Tick>`    | one       | block      |
//! | `FastFillQueue`  | `FastQueue<Fill>`    | many      | reject     |
//! | `FastEventQueue` | `FastQueue<Event>`   | many      | reject     |
//! | `EventQueue`     | `FastQueue<Event>`   | many      | block      |
//! | `FastQueue<T>`   | generic              | many      | per queue  |
//!
//! Each queue has a single consumer. A consumer unit that attaches itself
//! with `attach_consumer` is notified on every successful enqueue, so it
//! can return `Pause` while the queue is empty. Wakes are edge-triggered,
//! so a burst costs one wake.
//!
//! Order is FIFO per queue. Nothing is promised across queues.
//!
//! A blocking enqueue spins, then sleeps in short steps. A unit must not
//! block-enqueue into a queue whose consumer runs on its own worker: the
//! consumer can't drain while the producer holds the worker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

mod fast_queue;
mod messages;
mod spsc_queue;

pub use fast_queue::FastQueue;
pub use messages::{Event, Fill, Side, Tick};
pub use spsc_queue::{SpscQueue, SpscReceiver, SpscSender};

pub type TickQueue = SpscQueue<Tick>;
pub type FastFillQueue = FastQueue<Fill>;
pub type FastEventQueue = FastQueue<Event>;
pub type EventQueue = FastQueue<Event>;

/// What a producer experiences on a full queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OverflowPolicy {
    /// Fail immediately, handing the value back.
    Reject,
    /// Wait for space.
    Block,
}

/// Enqueue failure. Always returns the value so the producer decides what
/// to do with it.
#[derive(PartialEq, Eq)]
pub enum EnqueueError<T> {
    Full(T),
    Closed(T),
    /// A blocking enqueue ran out of time.
    Timeout(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(v) | EnqueueError::Closed(v) | EnqueueError::Timeout(v) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, EnqueueError::Full(_))
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("Full(..)"),
            EnqueueError::Closed(_) => f.write_str("Closed(..)"),
            EnqueueError::Timeout(_) => f.write_str("Timeout(..)"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("queue is full"),
            EnqueueError::Closed(_) => f.write_str("queue is closed"),
            EnqueueError::Timeout(_) => f.write_str("timed out waiting for queue space"),
        }
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

/// Snapshot of one queue, as reported by `ParallelHandle::queue_stats`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub name: String,
    pub kind: &'static str,
    pub policy: OverflowPolicy,
    pub len: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    /// Enqueues that had to wait for space.
    pub blocked: u64,
    pub high_water: usize,
    pub closed: bool,
}

/// Type-erased stats access for the runtime's queue registry.
pub(crate) trait QueueProbe: Send + Sync {
    fn stats(&self) -> QueueStats;
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dequeued: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) blocked: AtomicU64,
    pub(crate) high_water: AtomicU64,
}

impl QueueCounters {
    #[inline]
    pub(crate) fn on_enqueue(&self, len_after: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.high_water.fetch_max(len_after as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_dequeue(&self, n: u64) {
        self.dequeued.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> (u64, u64, u64, u64, usize) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            self.high_water.load(Ordering::Relaxed) as usize,
        )
    }
}
