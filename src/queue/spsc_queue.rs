//! Single-producer, single-consumer queue with claimable halves.
//!
//! The queue is created (usually by name through the runtime) and both
//! sides claim their half once: the producer with [`SpscQueue::take_producer`],
//! the consumer with [`SpscQueue::take_consumer`]. Each half is owned by one
//! unit, so pushes and pops need no CAS at all.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::{EnqueueError, OverflowPolicy, QueueCounters, QueueProbe, QueueStats};
use crate::scheduler::Agent;
use crate::stdx::{spsc_channel, SpscConsumer, SpscProducer};

const BLOCK_SLEEP: Duration = Duration::from_micros(50);

struct Shared<T> {
    name: String,
    kind: &'static str,
    policy: OverflowPolicy,
    capacity: usize,
    producer: Mutex<Option<SpscProducer<T>>>,
    consumer: Mutex<Option<SpscConsumer<T>>>,
    closed: AtomicBool,
    consumer_agent: OnceLock<Agent>,
    counters: QueueCounters,
}

/// SPSC queue handle. Cloning yields another handle to the same queue.
pub struct SpscQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SpscQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Producing half of an [`SpscQueue`].
pub struct SpscSender<T> {
    tx: SpscProducer<T>,
    shared: Arc<Shared<T>>,
}

/// Consuming half of an [`SpscQueue`].
pub struct SpscReceiver<T> {
    rx: SpscConsumer<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> SpscQueue<T> {
    /// Holds exactly `capacity` items; the next enqueue follows `policy`.
    pub fn new(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_kind(name.into(), "SpscQueue", capacity, policy)
    }

    pub(crate) fn with_kind(
        name: String,
        kind: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        let (tx, rx) = spsc_channel(capacity);
        Self {
            shared: Arc::new(Shared {
                name,
                kind,
                policy,
                capacity: tx.capacity(),
                producer: Mutex::new(Some(tx)),
                consumer: Mutex::new(Some(rx)),
                closed: AtomicBool::new(false),
                consumer_agent: OnceLock::new(),
                counters: QueueCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Claim the producing half. `None` once claimed.
    pub fn take_producer(&self) -> Option<SpscSender<T>> {
        let tx = self
            .shared
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(SpscSender {
            tx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Claim the consuming half. `None` once claimed.
    pub fn take_consumer(&self) -> Option<SpscReceiver<T>> {
        let rx = self
            .shared
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(SpscReceiver {
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Register the unit to notify on every enqueue. First caller wins.
    pub fn attach_consumer(&self, agent: &Agent) -> bool {
        self.shared.consumer_agent.get_or_init(|| agent.clone()).id() == agent.id()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

impl<T> Shared<T> {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(agent) = self.consumer_agent.get() {
            agent.notify();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> QueueStats {
        let (enqueued, dequeued, rejected, blocked, high_water) = self.counters.load();
        QueueStats {
            name: self.name.clone(),
            kind: self.kind,
            policy: self.policy,
            len: enqueued.saturating_sub(dequeued) as usize,
            capacity: self.capacity,
            enqueued,
            dequeued,
            rejected,
            blocked,
            high_water,
            closed: self.is_closed(),
        }
    }
}

impl<T: Send + 'static> QueueProbe for SpscQueue<T> {
    fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

impl<T> SpscSender<T> {
    /// Enqueue following the queue's policy.
    pub fn enqueue(&mut self, value: T) -> Result<(), EnqueueError<T>> {
        match self.shared.policy {
            OverflowPolicy::Reject => self.try_enqueue(value),
            OverflowPolicy::Block => self.push_blocking(value, None),
        }
    }

    pub fn try_enqueue(&mut self, value: T) -> Result<(), EnqueueError<T>> {
        if self.shared.is_closed() {
            return Err(EnqueueError::Closed(value));
        }
        match self.tx.try_push(value) {
            Ok(()) => {
                self.after_push();
                Ok(())
            }
            Err(v) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full(v))
            }
        }
    }

    pub fn enqueue_timeout(&mut self, value: T, timeout: Duration) -> Result<(), EnqueueError<T>> {
        match self.shared.policy {
            OverflowPolicy::Reject => self.try_enqueue(value),
            OverflowPolicy::Block => self.push_blocking(value, Some(Instant::now() + timeout)),
        }
    }

    fn push_blocking(&mut self, mut value: T, deadline: Option<Instant>) -> Result<(), EnqueueError<T>> {
        let backoff = Backoff::new();
        let mut waited = false;
        loop {
            if self.shared.is_closed() {
                return Err(EnqueueError::Closed(value));
            }
            match self.tx.try_push(value) {
                Ok(()) => {
                    self.after_push();
                    return Ok(());
                }
                Err(v) => value = v,
            }
            if !waited {
                waited = true;
                self.shared.counters.blocked.fetch_add(1, Ordering::Relaxed);
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
        let (enqueued, dequeued, ..) = self.shared.counters.load();
        self.shared
            .counters
            .on_enqueue((enqueued + 1).saturating_sub(dequeued) as usize);
        if let Some(agent) = self.shared.consumer_agent.get() {
            agent.notify();
        }
    }
}

impl<T> SpscReceiver<T> {
    pub fn dequeue(&mut self) -> Option<T> {
        let v = self.rx.try_pop()?;
        self.shared.counters.on_dequeue(1);
        Some(v)
    }

    pub fn drain_into(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let n = self.rx.pop_into(out, max);
        self.shared.counters.on_dequeue(n as u64);
        n
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Closed and fully drained.
    pub fn is_finished(&self) -> bool {
        self.shared.is_closed() && self.rx.is_empty()
    }
}

impl<T> fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscQueue")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}
