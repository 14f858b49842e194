//! Deterministic yield policies.
//!
//! Workers bound same-tick `Invoke` chains with a [`YieldPolicy`]: each
//! re-entry counts as one work unit, and once the policy says "yield" the slot
//! is requeued behind its siblings exactly as if it had returned `Repeat`.
//! The decision depends only on the number of re-entries, never on wall
//! time, so replays under the Normal clock interleave identically.
//!
//! # Invariants
//!
//! - `should_yield` is O(1) and a pure function of work units and state.
//! - After any call, `counter() < interval()`.
//! - Chunking invariance: `should_yield(15)` leaves the same state as
//!   `should_yield(10)` followed by `should_yield(5)`.

/// Deterministic yield policy.
pub trait YieldPolicy: Send {
    /// Record `work_units` and report whether control should go back to the
    /// worker.
    fn should_yield(&mut self, work_units: u64) -> bool;

    /// Start a new cycle.
    fn reset(&mut self);

    fn counter(&self) -> u64;

    fn interval(&self) -> u64;
}

/// Yield every `interval` work units.
#[derive(Clone, Debug)]
pub struct EveryN {
    interval: u64,
    counter: u64,
}

impl EveryN {
    /// # Panics
    ///
    /// Panics if `interval` is 0.
    pub fn new(interval: u64) -> Self {
        assert!(interval > 0, "yield interval must be > 0");
        Self {
            interval,
            counter: 0,
        }
    }
}

impl YieldPolicy for EveryN {
    #[inline]
    fn should_yield(&mut self, work_units: u64) -> bool {
        self.counter = self.counter.saturating_add(work_units);
        if self.counter >= self.interval {
            self.counter %= self.interval;
            true
        } else {
            false
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.counter = 0;
    }

    #[inline]
    fn counter(&self) -> u64 {
        self.counter
    }

    #[inline]
    fn interval(&self) -> u64 {
        self.interval
    }
}

impl Default for EveryN {
    /// 64 same-tick re-entries.
    fn default() -> Self {
        Self::new(64)
    }
}
