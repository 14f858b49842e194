//! Hashed timing wheel with FIFO buckets, fixed node pool and occupancy bitmap.
//!
//! Time unit is microseconds of runtime clock. Bucket key is `ceil(at / G)`.
//!
//! # Semantics
//!
//! This is **bucketed scheduling**:
//! - Items never fire early (before `at`).
//! - Items may fire up to `G - 1` units late. Callers needing exact deadlines
//!   push `floor(at / G) * G` and re-check the exact deadline on drain.
//!
//! # Model
//!
//! ```text
//!   ------------------------------------------------------------------>
//!   |         |                   |                         |
//!   0     cursor_abs          now_bucket            cursor_abs + W
//!         (next to                                   (horizon limit)
//!          process)
//!
//!   [0, cursor_abs)                  drained or skipped
//!   [cursor_abs, now_bucket]         due on next advance
//!   (now_bucket, cursor_abs + W)     future, valid to push
//!   >= cursor_abs + W                TooFarInFuture
//! ```
//!
//! Each slot is an intrusive FIFO list over a fixed node pool. A flat bitmap
//! marks non-empty slots so `advance_and_drain` jumps over empty buckets.
//!
//! # Invariants
//!
//! - `wheel_size` is a power of two `>= 2`.
//! - A slot only ever holds one absolute key (enforced by the horizon check).
//! - `head[slot] == NONE` iff the slot is empty and its bitmap bit is clear.
//! - `now` passed to `advance_and_drain` is monotone non-decreasing.

use std::mem::MaybeUninit;

const NONE: u32 = u32::MAX;

/// Errors returned by [`TimingWheel::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// No free node in the fixed pool.
    PoolExhausted,
    /// Key is at or beyond `base + wheel_size`.
    TooFarInFuture { key: u64, base: u64, wheel_size: u64 },
}

/// Result of a successful [`TimingWheel::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "Ready(T) must be handled immediately"]
pub enum PushOutcome<T> {
    Scheduled,
    /// Already due relative to the wheel base.
    Ready(T),
}

/// Hashed timing wheel.
///
/// `T` is `Copy` because payloads sit in `MaybeUninit` storage and are read
/// out exactly once on drain.
pub struct TimingWheel<T: Copy, const G: u32> {
    wheel_mask: usize,
    wheel_size: u64,

    head: Box<[u32]>,
    tail: Box<[u32]>,
    slot_key: Box<[u64]>,
    occ: Box<[u64]>,

    next: Box<[u32]>,
    payload: Box<[MaybeUninit<T>]>,
    free_head: u32,

    cursor_abs: u64,
    now_bucket: u64,

    len: usize,
    cap: usize,
}

impl<T: Copy, const G: u32> TimingWheel<T, G> {
    /// Create a wheel that accepts deadlines up to `max_horizon` past the
    /// current base, with room for `node_cap` pending items.
    pub fn new(max_horizon: u64, node_cap: usize) -> Self {
        const { assert!(G > 0, "G must be positive") };
        assert!(node_cap < NONE as usize, "node_cap too large");

        let g = G as u64;
        let required = ceil_div(max_horizon.saturating_add(g - 1), g).saturating_add(1);
        let wheel_size = usize::try_from(required)
            .unwrap_or(1 << 30)
            .clamp(2, 1 << 30)
            .next_power_of_two();

        let mut next = vec![NONE; node_cap];
        for (i, n) in next.iter_mut().enumerate().take(node_cap.saturating_sub(1)) {
            *n = (i + 1) as u32;
        }

        Self {
            wheel_mask: wheel_size - 1,
            wheel_size: wheel_size as u64,
            head: vec![NONE; wheel_size].into_boxed_slice(),
            tail: vec![NONE; wheel_size].into_boxed_slice(),
            slot_key: vec![0; wheel_size].into_boxed_slice(),
            occ: vec![0; wheel_size.div_ceil(64)].into_boxed_slice(),
            next: next.into_boxed_slice(),
            payload: vec![MaybeUninit::uninit(); node_cap].into_boxed_slice(),
            free_head: if node_cap == 0 { NONE } else { 0 },
            cursor_abs: 0,
            now_bucket: 0,
            len: 0,
            cap: node_cap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Largest deadline (exclusive) that can be pushed right now.
    #[inline]
    pub fn horizon_end(&self) -> u64 {
        self.cursor_abs
            .saturating_add(self.wheel_size)
            .saturating_sub(1)
            .saturating_mul(G as u64)
    }

    /// Schedule `payload` to become due at `at`.
    pub fn push(&mut self, at: u64, payload: T) -> Result<PushOutcome<T>, PushError> {
        let key = ceil_div(at, G as u64);
        if key < self.cursor_abs {
            return Ok(PushOutcome::Ready(payload));
        }
        if key >= self.cursor_abs.saturating_add(self.wheel_size) {
            return Err(PushError::TooFarInFuture {
                key,
                base: self.cursor_abs,
                wheel_size: self.wheel_size,
            });
        }

        let idx = self.alloc_node(payload).ok_or(PushError::PoolExhausted)?;
        let slot = (key as usize) & self.wheel_mask;
        if self.head[slot] == NONE {
            self.slot_key[slot] = key;
            self.head[slot] = idx;
            self.tail[slot] = idx;
            self.occ[slot / 64] |= 1u64 << (slot % 64);
        } else {
            debug_assert_eq!(self.slot_key[slot], key, "slot collision inside horizon");
            let t = self.tail[slot];
            self.next[t as usize] = idx;
            self.tail[slot] = idx;
        }
        self.next[idx as usize] = NONE;
        self.len += 1;
        Ok(PushOutcome::Scheduled)
    }

    /// Advance to `now` and drain every bucket with key `<= floor(now / G)`.
    ///
    /// Buckets drain in ascending key order, items within a bucket FIFO.
    /// Returns the number of items drained.
    pub fn advance_and_drain<F: FnMut(T)>(&mut self, now: u64, mut on_ready: F) -> usize {
        let now_bucket = now / G as u64;
        if now_bucket < self.now_bucket {
            debug_assert!(false, "time went backwards: {now_bucket} < {}", self.now_bucket);
            return 0;
        }
        if now_bucket == self.now_bucket && self.cursor_abs > now_bucket {
            return 0;
        }
        self.now_bucket = now_bucket;

        let mut drained = 0;
        while self.cursor_abs <= now_bucket && self.len > 0 {
            let from = (self.cursor_abs as usize) & self.wheel_mask;
            let Some(slot) = self.find_next_set_cyclic(from) else {
                break;
            };
            let dist = if slot >= from {
                slot - from
            } else {
                self.wheel_mask + 1 - (from - slot)
            };
            let abs_key = self.cursor_abs + dist as u64;
            if abs_key > now_bucket {
                break;
            }
            debug_assert_eq!(self.slot_key[slot], abs_key);

            let mut n = self.head[slot];
            self.head[slot] = NONE;
            self.tail[slot] = NONE;
            self.occ[slot / 64] &= !(1u64 << (slot % 64));

            while n != NONE {
                let next = self.next[n as usize];
                // SAFETY: node `n` was written in alloc_node and is read once
                // before returning to the free list.
                let val = unsafe { self.payload[n as usize].assume_init_read() };
                self.free_node(n);
                self.len -= 1;
                drained += 1;
                on_ready(val);
                n = next;
            }
            self.cursor_abs = abs_key + 1;
        }

        if self.cursor_abs <= now_bucket {
            self.cursor_abs = now_bucket.saturating_add(1);
        }
        drained
    }

    fn find_next_set_cyclic(&self, from: usize) -> Option<usize> {
        self.find_next_set_ge(from)
            .or_else(|| if from > 0 { self.find_next_set_ge(0) } else { None })
    }

    fn find_next_set_ge(&self, from: usize) -> Option<usize> {
        let mut word = from / 64;
        let mut bits = self.occ[word] & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                return Some(word * 64 + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word >= self.occ.len() {
                return None;
            }
            bits = self.occ[word];
        }
    }

    #[inline]
    fn alloc_node(&mut self, val: T) -> Option<u32> {
        let idx = self.free_head;
        if idx == NONE {
            return None;
        }
        self.free_head = self.next[idx as usize];
        self.payload[idx as usize].write(val);
        Some(idx)
    }

    #[inline]
    fn free_node(&mut self, idx: u32) {
        self.next[idx as usize] = self.free_head;
        self.free_head = idx;
    }
}

#[inline]
fn ceil_div(x: u64, d: u64) -> u64 {
    x / d + (x % d != 0) as u64
}
