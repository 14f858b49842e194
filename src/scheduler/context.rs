//! Per-slot context passed to every lifecycle hook.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::agent::{Agent, TaskId};
use super::executor::ParallelHandle;
use super::io::IoTicket;
use crate::time::{ClockMode, Timer, TimerEvent};

/// What a unit can see and do from inside `initialize`, `invoke` and
/// `shutdown`.
///
/// The context lives as long as the slot; the worker hands out `&mut` to it
/// for the duration of one hook call.
pub struct TaskContext {
    agent: Agent,
    runtime: ParallelHandle,
    wake_at: Option<u64>,
}

impl TaskContext {
    pub(crate) fn new(agent: Agent, runtime: ParallelHandle) -> Self {
        Self {
            agent,
            runtime,
            wake_at: None,
        }
    }

    /// Handle to this slot.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.agent.id()
    }

    #[inline]
    pub fn worker(&self) -> usize {
        self.agent.worker()
    }

    /// Runtime handle, for spawning, addressing and the named factories.
    #[inline]
    pub fn runtime(&self) -> &ParallelHandle {
        &self.runtime
    }

    /// Runtime clock in microseconds.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.runtime.micro_count()
    }

    pub fn tick_count(&self) -> u64 {
        self.runtime.tick_count()
    }

    pub fn utc_now(&self) -> DateTime<Utc> {
        self.runtime.utc_now()
    }

    pub fn mode(&self) -> ClockMode {
        self.runtime.mode()
    }

    /// Set the wake time used by a `DelayInvoke` returned from this call to
    /// `now + after`.
    pub fn delay(&mut self, after: Duration) {
        let after = u64::try_from(after.as_micros()).unwrap_or(u64::MAX);
        self.wake_at = Some(self.now_us().saturating_add(after));
    }

    /// Set an absolute wake time (runtime microseconds).
    pub fn set_wake_at(&mut self, at_us: u64) {
        self.wake_at = Some(at_us);
    }

    pub fn wake_at(&self) -> Option<u64> {
        self.wake_at
    }

    pub(crate) fn take_wake_at(&mut self) -> Option<u64> {
        self.wake_at.take()
    }

    /// Create a timer that wakes this slot.
    pub fn create_timer(&self, name: &str) -> Timer {
        self.runtime.create_timer(name, &self.agent)
    }

    /// Create a timer that runs `action` on this worker, then wakes the slot.
    pub fn create_timer_with<F>(&self, name: &str, action: F) -> Timer
    where
        F: FnMut(&TimerEvent) + Send + 'static,
    {
        self.runtime.create_timer_with(name, &self.agent, action)
    }

    /// Run blocking `job` on the I/O pool and wake this slot when it
    /// completes. Return `Pause` and poll the ticket on the next invocation.
    pub fn release_io<R, F>(&self, job: F) -> IoTicket<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.runtime.release_io(&self.agent, job)
    }
}
