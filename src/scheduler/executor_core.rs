//! Runtime state word and idle policy shared by every worker.
//!
//! # Combined state
//!
//! ```text
//! State = (live_slots << 1) | accepting_bit
//!
//!        63                              1   0
//!       ┌─────────────────────────────┬─────┐
//!       │         live_slots          │ A   │
//!       └─────────────────────────────┴─────┘
//! ```
//!
//! | Operation         | Atomic         | Effect                                   |
//! |-------------------|----------------|------------------------------------------|
//! | init              | store          | `state = 1` (accepting, no slots)        |
//! | spawn             | CAS loop       | if accepting: count++                    |
//! | child spawn       | CAS loop       | if count > 0: count++ (gate may be shut) |
//! | teardown          | `fetch_sub(2)` | count--; last one after close: done      |
//! | join / shutdown   | `fetch_and(!1)`| clear accepting bit                      |
//!
//! Checking "accepting" and bumping the count in one CAS means a spawn can
//! never slip in after `join` decided the runtime is empty. A child spawn
//! comes from a live slot, so the count it sees is at least one and the
//! runtime cannot have been declared done yet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// LSB in the combined state: 1 while spawns are accepted.
pub(crate) const ACCEPTING_BIT: usize = 1;
/// Count unit for the combined state (count stored in bits 1+).
pub(crate) const COUNT_UNIT: usize = 2;

/// Outcome of a single worker step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerStepResult {
    /// A command, deadline or non-idle invocation happened.
    Progress,
    /// Nothing happened; keep spinning.
    NoWork,
    ShouldPark { timeout: Duration },
    ExitDone,
}

/// Idle decision returned by [`IdleHooks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IdleAction {
    Continue,
    Park { timeout: Duration },
}

/// Idle policy hook for the worker step.
///
/// `on_idle` performs any spin/yield side effects and says whether the
/// caller should park. `on_work` resets idle state on progress.
pub(crate) trait IdleHooks {
    fn on_work(&mut self);
    fn on_idle(&mut self) -> IdleAction;
}

/// Spin, then occasionally yield the thread, then park with a timeout.
#[derive(Debug)]
pub(crate) struct TieredIdle {
    spin_iters: u32,
    park_timeout: Duration,
    idle_rounds: u32,
}

impl TieredIdle {
    pub(crate) fn new(spin_iters: u32, park_timeout: Duration) -> Self {
        Self {
            spin_iters,
            park_timeout,
            idle_rounds: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_rounds(&self) -> u32 {
        self.idle_rounds
    }
}

impl IdleHooks for TieredIdle {
    fn on_work(&mut self) {
        self.idle_rounds = 0;
    }

    fn on_idle(&mut self) -> IdleAction {
        self.idle_rounds = self.idle_rounds.saturating_add(1);

        if self.idle_rounds <= self.spin_iters {
            std::hint::spin_loop();
            return IdleAction::Continue;
        }

        if (self.idle_rounds & 0xF) == 0 {
            thread::yield_now();
        }

        IdleAction::Park {
            timeout: self.park_timeout,
        }
    }
}

/// Live slot count from the combined state word.
#[inline(always)]
pub(crate) fn in_flight(state: usize) -> usize {
    state >> 1
}

#[inline(always)]
pub(crate) fn is_accepting(state: usize) -> bool {
    (state & ACCEPTING_BIT) != 0
}

/// Clear the accepting bit and return the previous state word.
#[inline(always)]
pub(crate) fn close_gate(state: &AtomicUsize) -> usize {
    state.fetch_and(!ACCEPTING_BIT, Ordering::AcqRel)
}

/// Bump the live count if the gate is open. `false` once closed.
#[inline]
pub(crate) fn try_increment(state: &AtomicUsize) -> bool {
    let mut s = state.load(Ordering::Acquire);
    loop {
        if !is_accepting(s) {
            return false;
        }
        match state.compare_exchange_weak(
            s,
            s.wrapping_add(COUNT_UNIT),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => s = actual,
        }
    }
}

/// Bump the live count while at least one slot is live, whether or not the
/// gate is open. `false` once the count reached zero.
#[inline]
pub(crate) fn try_increment_live(state: &AtomicUsize) -> bool {
    let mut s = state.load(Ordering::Acquire);
    loop {
        if in_flight(s) == 0 {
            return false;
        }
        match state.compare_exchange_weak(
            s,
            s.wrapping_add(COUNT_UNIT),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => s = actual,
        }
    }
}

/// Drop the live count; returns the previous state word.
#[inline(always)]
pub(crate) fn decrement_count(state: &AtomicUsize) -> usize {
    let prev = state.fetch_sub(COUNT_UNIT, Ordering::AcqRel);
    debug_assert!(in_flight(prev) > 0, "live slot count underflow");
    prev
}

/// Whether the decrement that saw `prev` emptied a closed runtime.
#[inline(always)]
pub(crate) fn was_last_after_close(prev: usize) -> bool {
    in_flight(prev) == 1 && !is_accepting(prev)
}
