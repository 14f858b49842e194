//! Named timers bound to a scheduling slot, plus the per-worker deadline
//! queue that backs both timers and `DelayInvoke`.
//!
//! A [`Timer`] is armed from any thread; arming sends a command to the
//! owning worker, which records the deadline in its [`Deadlines`]. When the
//! deadline passes, the worker runs the timer action (on the worker thread,
//! with the slot's thread affinity) and then wakes the slot.
//!
//! Cancellation bumps a generation counter; stale queue entries are dropped
//! when they come due.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::scheduler::task::Command;
use crate::scheduler::{Agent, TaskId};
use crate::stdx::{PushOutcome, TimingWheel};

use super::Clock;

/// Wheel bucket width in microseconds.
pub(crate) const BUCKET_US: u32 = 100;

/// Passed to a timer action when it fires.
#[derive(Clone, Debug)]
pub struct TimerEvent {
    pub name: Arc<str>,
    pub task: TaskId,
    /// Deadline the timer was armed for.
    pub scheduled_us: u64,
    /// Runtime clock when the action ran.
    pub fired_us: u64,
}

/// Callback run on the owning worker when a timer fires.
pub type TimerAction = Box<dyn FnMut(&TimerEvent) + Send + 'static>;

pub(crate) struct TimerShared {
    pub(crate) id: u64,
    name: Arc<str>,
    agent: Agent,
    clock: Arc<Clock>,
    active: AtomicBool,
    seq: AtomicU32,
    action: Mutex<Option<TimerAction>>,
}

impl TimerShared {
    /// Worker side: consume a due entry. Returns `true` if the timer fired
    /// and the owning slot should be woken.
    pub(crate) fn fire(&self, seq: u32, scheduled_us: u64, now: u64) -> bool {
        if self.seq.load(Ordering::Acquire) != seq {
            return false;
        }
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let event = TimerEvent {
            name: Arc::clone(&self.name),
            task: self.agent.id(),
            scheduled_us,
            fired_us: now,
        };
        let mut action = self.action.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(f) = action.as_mut() {
            f(&event);
        }
        true
    }

    pub(crate) fn task(&self) -> TaskId {
        self.agent.id()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a named timer bound to one slot.
///
/// Cloning yields another handle to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerShared>,
}

impl Timer {
    pub(crate) fn new(
        id: u64,
        name: &str,
        agent: Agent,
        clock: Arc<Clock>,
        action: Option<TimerAction>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerShared {
                id,
                name: Arc::from(name),
                agent,
                clock,
                active: AtomicBool::new(false),
                seq: AtomicU32::new(0),
                action: Mutex::new(action),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Slot this timer wakes.
    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    /// Arm the timer for runtime time `at_us`.
    ///
    /// Starting an already-active timer is a no-op: it logs a warning and
    /// returns `false`. Also returns `false` if the slot is gone.
    pub fn start(&self, at_us: u64) -> bool {
        let inner = &self.inner;
        if inner.active.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                timer = %inner.name,
                task = %inner.agent.id(),
                "start on an active timer ignored"
            );
            return false;
        }
        let seq = inner.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let sent = inner.agent.is_alive()
            && inner.agent.send(Command::ArmTimer {
                timer: Arc::clone(inner),
                seq,
                at_us,
            });
        if !sent {
            inner.active.store(false, Ordering::Release);
        }
        sent
    }

    /// Arm the timer `delay` from now.
    pub fn start_after(&self, delay: Duration) -> bool {
        let delay = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.start(self.inner.clock.micro_count().saturating_add(delay))
    }

    /// Disarm. Returns whether the timer was active.
    pub fn cancel(&self) -> bool {
        self.inner.seq.fetch_add(1, Ordering::AcqRel);
        self.inner.active.swap(false, Ordering::AcqRel)
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Replace the action run on fire.
    pub fn set_action(&self, action: Option<TimerAction>) {
        *self
            .inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = action;
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.inner.name)
            .field("task", &self.inner.agent.id())
            .field("active", &self.active())
            .finish()
    }
}

/// A pending deadline on one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// `DelayInvoke` wake for a slot. `seq` must match the slot's delay
    /// generation or the entry is stale.
    Slot {
        index: u32,
        task: TaskId,
        seq: u32,
        at: u64,
    },
    Timer { id: u64, seq: u32, at: u64 },
}

impl Deadline {
    #[inline]
    pub(crate) fn at(&self) -> u64 {
        match *self {
            Deadline::Slot { at, .. } | Deadline::Timer { at, .. } => at,
        }
    }
}

/// Per-worker deadline queue.
///
/// Deadlines within the wheel horizon go into a [`TimingWheel`] keyed by
/// their 100µs bucket; the rest wait in an ordered overflow map. Entries
/// drained from the wheel before their exact deadline are parked in `near`
/// until it passes, so nothing fires early.
pub(crate) struct Deadlines {
    wheel: TimingWheel<Deadline, BUCKET_US>,
    overflow: BTreeMap<(u64, u64), Deadline>,
    near: Vec<Deadline>,
    ordinal: u64,
}

impl Deadlines {
    pub(crate) fn new(horizon: Duration, capacity: usize) -> Self {
        let horizon = u64::try_from(horizon.as_micros()).unwrap_or(u64::MAX);
        Self {
            wheel: TimingWheel::new(horizon, capacity),
            overflow: BTreeMap::new(),
            near: Vec::new(),
            ordinal: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.wheel.len() + self.overflow.len() + self.near.len()
    }

    pub(crate) fn push(&mut self, entry: Deadline) {
        let at = entry.at();
        let bucket_start = at - at % BUCKET_US as u64;
        match self.wheel.push(bucket_start, entry) {
            Ok(PushOutcome::Scheduled) => {}
            Ok(PushOutcome::Ready(e)) => self.near.push(e),
            Err(_) => {
                self.overflow.insert((at, self.ordinal), entry);
                self.ordinal = self.ordinal.wrapping_add(1);
            }
        }
    }

    /// Move every entry with `at <= now` into `out`, ordered by deadline
    /// (ties keep insertion order).
    pub(crate) fn drain_due(&mut self, now: u64, out: &mut Vec<Deadline>) {
        let start = out.len();
        let near = &mut self.near;
        self.wheel.advance_and_drain(now, |e| near.push(e));
        near.retain(|e| {
            if e.at() <= now {
                out.push(*e);
                false
            } else {
                true
            }
        });
        while let Some(entry) = self.overflow.first_entry() {
            if entry.key().0 > now {
                break;
            }
            out.push(entry.remove());
        }
        out[start..].sort_by_key(Deadline::at);
    }

    pub(crate) fn clear(&mut self) {
        self.wheel.advance_and_drain(u64::MAX, |_| {});
        self.overflow.clear();
        self.near.clear();
    }
}
