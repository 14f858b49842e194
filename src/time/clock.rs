//! Runtime clock with two regimes.
//!
//! - **Normal**: simulated, deterministic time. It only moves when the owner
//!   calls [`Clock::advance_to`]/[`Clock::advance_by`], so backtests replay
//!   identically no matter how fast the data is consumed.
//! - **RealTime**: wall-clock time measured from a monotonic `Instant`.
//!
//! `micro_count` is monotone across mode switches: switching regimes rebases
//! the new regime onto the last value the old one reported.
//!
//! All readers are lock-free. Mode switches serialize on a mutex.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

/// Clock regime for the whole runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ClockMode {
    /// Accelerated, deterministic simulation time.
    #[default]
    Normal,
    /// Wall-clock time.
    RealTime,
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockMode::Normal => f.write_str("Normal"),
            ClockMode::RealTime => f.write_str("RealTime"),
        }
    }
}

impl ClockMode {
    fn to_u8(self) -> u8 {
        match self {
            ClockMode::Normal => 0,
            ClockMode::RealTime => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 {
            ClockMode::RealTime
        } else {
            ClockMode::Normal
        }
    }
}

/// Shared runtime clock. Time unit is microseconds since runtime start.
pub struct Clock {
    mode: AtomicU8,
    origin: Instant,
    epoch: DateTime<Utc>,
    /// Simulated time (Normal mode).
    sim_us: AtomicU64,
    /// Added to `origin.elapsed()` in RealTime mode.
    rt_shift_us: AtomicI64,
    switch: Mutex<()>,
}

impl Clock {
    /// Create a clock in `mode`. `epoch` is the UTC instant that
    /// `micro_count() == 0` corresponds to.
    pub fn new(mode: ClockMode, epoch: DateTime<Utc>) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_u8()),
            origin: Instant::now(),
            epoch,
            sim_us: AtomicU64::new(0),
            rt_shift_us: AtomicI64::new(0),
            switch: Mutex::new(()),
        }
    }

    #[inline]
    pub fn mode(&self) -> ClockMode {
        ClockMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Switch regimes. Returns the previous mode.
    pub fn set_mode(&self, mode: ClockMode) -> ClockMode {
        let _guard = self
            .switch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let prev = self.mode();
        if prev == mode {
            return prev;
        }
        let now = self.micro_count();
        match mode {
            ClockMode::Normal => {
                self.sim_us.fetch_max(now, Ordering::AcqRel);
            }
            ClockMode::RealTime => {
                let elapsed = self.elapsed_us() as i64;
                self.rt_shift_us
                    .store((now as i64).saturating_sub(elapsed), Ordering::Release);
            }
        }
        self.mode.store(mode.to_u8(), Ordering::Release);
        tracing::info!(from = %prev, to = %mode, at_us = now, "clock mode switched");
        prev
    }

    /// Microseconds since runtime start in the active regime.
    #[inline]
    pub fn micro_count(&self) -> u64 {
        match self.mode() {
            ClockMode::Normal => self.sim_us.load(Ordering::Acquire),
            ClockMode::RealTime => {
                let shift = self.rt_shift_us.load(Ordering::Acquire);
                (self.elapsed_us() as i64).saturating_add(shift).max(0) as u64
            }
        }
    }

    /// Milliseconds since runtime start in the active regime.
    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.micro_count() / 1_000
    }

    /// Current UTC time in the active regime.
    pub fn utc_now(&self) -> DateTime<Utc> {
        let us = i64::try_from(self.micro_count()).unwrap_or(i64::MAX);
        self.epoch + TimeDelta::microseconds(us)
    }

    /// UTC instant at which `micro_count() == 0`.
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Convert a UTC instant into runtime microseconds (clamped at 0).
    pub fn micros_at(&self, at: DateTime<Utc>) -> u64 {
        (at - self.epoch).num_microseconds().unwrap_or(0).max(0) as u64
    }

    /// Move simulated time forward to `us`. No-op when `us` is in the past.
    ///
    /// Returns `false` in RealTime mode, where time can't be driven.
    pub fn advance_to(&self, us: u64) -> bool {
        if self.mode() != ClockMode::Normal {
            return false;
        }
        self.sim_us.fetch_max(us, Ordering::AcqRel);
        true
    }

    /// Move simulated time forward by `dt`.
    pub fn advance_by(&self, dt: Duration) -> bool {
        if self.mode() != ClockMode::Normal {
            return false;
        }
        let dt = u64::try_from(dt.as_micros()).unwrap_or(u64::MAX);
        let now = self.sim_us.load(Ordering::Acquire);
        self.advance_to(now.saturating_add(dt))
    }

    /// Move simulated time forward to the UTC instant `at`.
    pub fn advance_to_utc(&self, at: DateTime<Utc>) -> bool {
        self.advance_to(self.micros_at(at))
    }

    #[inline]
    fn elapsed_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("mode", &self.mode())
            .field("micro_count", &self.micro_count())
            .field("epoch", &self.epoch)
            .finish()
    }
}
