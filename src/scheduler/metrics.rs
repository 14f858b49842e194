//! Worker metrics.
//!
//! Two layers:
//!
//! - [`WorkerMetricsLocal`]: plain counters owned by one worker thread. No
//!   atomics on the hot path; merged into a [`MetricsSnapshot`] after the
//!   workers join.
//! - [`WorkerStatsCell`]: a handful of relaxed atomics each worker publishes
//!   periodically (every few hundred steps, before parking and on exit) so
//!   [`super::ParallelHandle::stats`] can be read while the runtime runs.
//!
//! Histograms are log2-bucketed: bucket k covers `[2^k, 2^(k+1))`. That is
//! coarse, but enough to tell "a few re-entries per invoke" from "the
//! fairness budget is being hit every time".

use std::sync::atomic::{AtomicU64, Ordering};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::time::ClockMode;

/// Log2-bucketed histogram.
#[derive(Clone, Debug)]
pub struct Log2Hist {
    pub buckets: [u64; 64],
    pub count: u64,
    pub sum: u64,
}

impl Default for Log2Hist {
    fn default() -> Self {
        Self::new()
    }
}

impl Log2Hist {
    pub const fn new() -> Self {
        Self {
            buckets: [0; 64],
            count: 0,
            sum: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, v: u64) {
        let b = bucket_index(v);
        self.buckets[b] = self.buckets[b].wrapping_add(1);
        self.count = self.count.wrapping_add(1);
        self.sum = self.sum.wrapping_add(v);
    }

    /// Lower bound of the bucket holding the `p` quantile (`0.0..=1.0`).
    pub fn percentile_lower_bound(&self, p: f64) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        debug_assert!((0.0..=1.0).contains(&p), "percentile must be in [0.0, 1.0]");

        let target = ((self.count as f64) * p).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (i, &c) in self.buckets.iter().enumerate() {
            seen = seen.wrapping_add(c);
            if seen >= target {
                return Some(bucket_lower_bound(i));
            }
        }
        Some(1u64 << 63)
    }

    #[inline]
    pub fn p50(&self) -> Option<u64> {
        self.percentile_lower_bound(0.50)
    }

    #[inline]
    pub fn p99(&self) -> Option<u64> {
        self.percentile_lower_bound(0.99)
    }

    #[inline]
    pub fn max_bucket(&self) -> Option<u64> {
        self.buckets
            .iter()
            .rposition(|&c| c > 0)
            .map(bucket_lower_bound)
    }

    #[inline]
    pub fn mean(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }

    pub fn merge(&mut self, other: &Log2Hist) {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a = a.wrapping_add(*b);
        }
        self.count = self.count.wrapping_add(other.count);
        self.sum = self.sum.wrapping_add(other.sum);
    }
}

/// Serialized as a summary; the raw buckets are not useful in JSON.
impl Serialize for Log2Hist {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Log2Hist", 5)?;
        s.serialize_field("count", &self.count)?;
        s.serialize_field("mean", &self.mean())?;
        s.serialize_field("p50", &self.p50())?;
        s.serialize_field("p99", &self.p99())?;
        s.serialize_field("max_bucket", &self.max_bucket())?;
        s.end()
    }
}

#[inline]
fn bucket_index(v: u64) -> usize {
    if v == 0 {
        0
    } else {
        (63 - v.leading_zeros()) as usize
    }
}

#[inline]
fn bucket_lower_bound(bucket: usize) -> u64 {
    if bucket == 0 {
        0
    } else {
        1u64 << bucket
    }
}

/// Per-worker counters. Owned by the worker thread; never shared.
#[derive(Clone, Debug, Default, Serialize)]
#[repr(align(64))]
pub struct WorkerMetricsLocal {
    /// Unit calls, counting every step of an `Invoke` chain.
    pub invocations: u64,
    /// Calls whose yield carried `is_idle`.
    pub idle_invocations: u64,
    /// Chains cut short by the fairness budget.
    pub budget_yields: u64,
    pub spawned: u64,
    pub terminated: u64,
    pub faults: u64,
    pub commands: u64,
    pub execs: u64,
    pub timers_fired: u64,
    pub delays_fired: u64,
    pub idle_spins: u64,
    pub park_count: u64,

    /// Calls per slot trip.
    pub invoke_chain: Log2Hist,
    /// Wall time per slot trip, in nanoseconds.
    pub invoke_time_ns: Log2Hist,
}

const _: () = assert!(std::mem::align_of::<WorkerMetricsLocal>() >= 64);

impl WorkerMetricsLocal {
    pub fn idle_ratio(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.idle_invocations as f64 / self.invocations as f64
        }
    }
}

/// Metrics merged across workers, returned by `Parallel::join` and
/// `Parallel::shutdown`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub idle_invocations: u64,
    pub budget_yields: u64,
    pub spawned: u64,
    pub terminated: u64,
    pub faults: u64,
    pub commands: u64,
    pub execs: u64,
    pub timers_fired: u64,
    pub delays_fired: u64,
    pub idle_spins: u64,
    pub park_count: u64,

    pub invoke_chain: Log2Hist,
    pub invoke_time_ns: Log2Hist,

    pub worker_count: u32,
    pub duration_ns: u64,
}

impl MetricsSnapshot {
    pub fn merge_worker(&mut self, w: &WorkerMetricsLocal) {
        self.invocations = self.invocations.wrapping_add(w.invocations);
        self.idle_invocations = self.idle_invocations.wrapping_add(w.idle_invocations);
        self.budget_yields = self.budget_yields.wrapping_add(w.budget_yields);
        self.spawned = self.spawned.wrapping_add(w.spawned);
        self.terminated = self.terminated.wrapping_add(w.terminated);
        self.faults = self.faults.wrapping_add(w.faults);
        self.commands = self.commands.wrapping_add(w.commands);
        self.execs = self.execs.wrapping_add(w.execs);
        self.timers_fired = self.timers_fired.wrapping_add(w.timers_fired);
        self.delays_fired = self.delays_fired.wrapping_add(w.delays_fired);
        self.idle_spins = self.idle_spins.wrapping_add(w.idle_spins);
        self.park_count = self.park_count.wrapping_add(w.park_count);

        self.invoke_chain.merge(&w.invoke_chain);
        self.invoke_time_ns.merge(&w.invoke_time_ns);

        self.worker_count = self.worker_count.wrapping_add(1);
    }

    pub fn invocations_per_sec(&self) -> f64 {
        if self.duration_ns == 0 {
            0.0
        } else {
            self.invocations as f64 / (self.duration_ns as f64 / 1_000_000_000.0)
        }
    }
}

/// Live gauges one worker publishes for readers on other threads.
#[derive(Debug, Default)]
pub(crate) struct WorkerStatsCell {
    slots: AtomicU64,
    ready: AtomicU64,
    paused: AtomicU64,
    delayed: AtomicU64,
    deadlines: AtomicU64,
    invocations: AtomicU64,
    parks: AtomicU64,
    faults: AtomicU64,
}

/// Gauges handed to [`WorkerStatsCell::publish`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WorkerGauges {
    pub slots: u64,
    pub ready: u64,
    pub paused: u64,
    pub delayed: u64,
    pub deadlines: u64,
}

impl WorkerStatsCell {
    pub(crate) fn publish(&self, g: WorkerGauges, m: &WorkerMetricsLocal) {
        self.slots.store(g.slots, Ordering::Relaxed);
        self.ready.store(g.ready, Ordering::Relaxed);
        self.paused.store(g.paused, Ordering::Relaxed);
        self.delayed.store(g.delayed, Ordering::Relaxed);
        self.deadlines.store(g.deadlines, Ordering::Relaxed);
        self.invocations.store(m.invocations, Ordering::Relaxed);
        self.parks.store(m.park_count, Ordering::Relaxed);
        self.faults.store(m.faults, Ordering::Relaxed);
    }

    pub(crate) fn read(&self, worker: usize) -> WorkerStats {
        WorkerStats {
            worker,
            slots: self.slots.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            deadlines: self.deadlines.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Last published state of one worker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker: usize,
    pub slots: u64,
    pub ready: u64,
    pub paused: u64,
    pub delayed: u64,
    /// Pending timer and delay deadlines.
    pub deadlines: u64,
    pub invocations: u64,
    pub parks: u64,
    pub faults: u64,
}

/// Runtime-wide view returned by [`super::ParallelHandle::stats`].
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeStats {
    pub mode: ClockMode,
    pub now_us: u64,
    pub accepting: bool,
    /// Slots spawned and not yet torn down.
    pub live_tasks: usize,
    pub workers: Vec<WorkerStats>,
}

impl RuntimeStats {
    pub fn total_invocations(&self) -> u64 {
        self.workers.iter().map(|w| w.invocations).sum()
    }

    pub fn total_parks(&self) -> u64 {
        self.workers.iter().map(|w| w.parks).sum()
    }

    pub fn total_faults(&self) -> u64 {
        self.workers.iter().map(|w| w.faults).sum()
    }
}
