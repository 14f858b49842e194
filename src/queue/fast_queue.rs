//! Bounded multi-producer queue over `crossbeam_queue::ArrayQueue`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

use super::{EnqueueError, OverflowPolicy, QueueCounters, QueueProbe, QueueStats};
use crate::scheduler::Agent;

/// Sleep between retries once a blocked producer has stopped spinning.
const BLOCK_SLEEP: Duration = Duration::from_micros(50);

struct Inner<T> {
    name: String,
    kind: &'static str,
    policy: OverflowPolicy,
    ring: ArrayQueue<T>,
    closed: AtomicBool,
    consumer: OnceLock<Agent>,
    counters: QueueCounters,
}

/// Bounded MPSC queue with an explicit overflow policy.
///
/// Cloning yields another handle to the same queue. Any number of handles
/// may enqueue; only the attached consumer should dequeue.
pub struct FastQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FastQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> FastQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_kind(name.into(), "FastQueue", capacity, policy)
    }

    pub(crate) fn with_kind(
        name: String,
        kind: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            inner: Arc::new(Inner {
                name,
                kind,
                policy,
                ring: ArrayQueue::new(capacity),
                closed: AtomicBool::new(false),
                consumer: OnceLock::new(),
                counters: QueueCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.inner.policy
    }

    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ring.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register the unit to notify on every enqueue. Only the first
    /// consumer sticks; returns whether `agent` is the attached one.
    pub fn attach_consumer(&self, agent: &Agent) -> bool {
        let attached = self.inner.consumer.get_or_init(|| agent.clone());
        attached.id() == agent.id()
    }

    /// Enqueue following the queue's policy: `Reject` fails on a full
    /// queue, `Block` waits for space.
    pub fn enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        match self.inner.policy {
            OverflowPolicy::Reject => self.try_enqueue(value),
            OverflowPolicy::Block => self.push_blocking(value, None),
        }
    }

    /// Never waits, whatever the policy.
    pub fn try_enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        if self.is_closed() {
            return Err(EnqueueError::Closed(value));
        }
        match self.inner.ring.push(value) {
            Ok(()) => {
                self.after_push();
                Ok(())
            }
            Err(v) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full(v))
            }
        }
    }

    /// Wait up to `timeout` for space. Under `Reject` this behaves like
    /// [`Self::try_enqueue`].
    pub fn enqueue_timeout(&self, value: T, timeout: Duration) -> Result<(), EnqueueError<T>> {
        match self.inner.policy {
            OverflowPolicy::Reject => self.try_enqueue(value),
            OverflowPolicy::Block => self.push_blocking(value, Some(Instant::now() + timeout)),
        }
    }

    fn push_blocking(&self, mut value: T, deadline: Option<Instant>) -> Result<(), EnqueueError<T>> {
        let backoff = Backoff::new();
        let mut waited = false;
        loop {
            if self.is_closed() {
                return Err(EnqueueError::Closed(value));
            }
            match self.inner.ring.push(value) {
                Ok(()) => {
                    self.after_push();
                    return Ok(());
                }
                Err(v) => value = v,
            }
            if !waited {
                waited = true;
                self.inner.counters.blocked.fetch_add(1, Ordering::Relaxed);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(EnqueueError::Timeout(value));
            }
            if backoff.is_completed() {
                thread::sleep(BLOCK_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    }

    #[inline]
    fn after_push(&self) {
        self.inner.counters.on_enqueue(self.inner.ring.len());
        if let Some(consumer) = self.inner.consumer.get() {
            consumer.notify();
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        let v = self.inner.ring.pop()?;
        self.inner.counters.on_dequeue(1);
        Some(v)
    }

    /// Move up to `max` items into `out`, oldest first. Returns the count.
    pub fn drain_into(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.inner.ring.pop() {
                Some(v) => {
                    out.push(v);
                    n += 1;
                }
                None => break,
            }
        }
        self.inner.counters.on_dequeue(n as u64);
        n
    }

    /// Refuse further enqueues. Items already queued can still be dequeued,
    /// and blocked producers give up with `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(consumer) = self.inner.consumer.get() {
            consumer.notify();
        }
    }

    pub fn stats(&self) -> QueueStats {
        let (enqueued, dequeued, rejected, blocked, high_water) = self.inner.counters.load();
        QueueStats {
            name: self.inner.name.clone(),
            kind: self.inner.kind,
            policy: self.inner.policy,
            len: self.len(),
            capacity: self.capacity(),
            enqueued,
            dequeued,
            rejected,
            blocked,
            high_water,
            closed: self.is_closed(),
        }
    }
}

impl<T: Send + 'static> QueueProbe for FastQueue<T> {
    fn stats(&self) -> QueueStats {
        FastQueue::stats(self)
    }
}

impl<T> fmt::Debug for FastQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastQueue")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("policy", &self.inner.policy)
            .field("len", &self.inner.ring.len())
            .field("capacity", &self.inner.ring.capacity())
            .finish()
    }
}
