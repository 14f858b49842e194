//! Wait-free SPSC (single-producer, single-consumer) bounded ring.
//!
//! # Design
//!
//! Rigtorp-style ring: the producer owns `tail`, the consumer owns `head`,
//! and each side caches the other side's index so the remote cache line is
//! only touched when the ring looks full (producer) or empty (consumer).
//! Capacity is chosen at runtime and is exact: a ring built for `k` items
//! rejects the `k + 1`th. Storage is rounded up to a power of two so the
//! slot index is a mask; the extra slots are never filled.
//!
//! ```text
//! Producer writes slot, then Release-stores tail  ->  consumer Acquire-loads tail, then reads slot
//! Consumer reads slot, then Release-stores head   ->  producer Acquire-loads head, then writes slot
//! ```
//!
//! The ring is non-blocking. Wait strategies (block vs reject) live in
//! [`crate::queue::SpscQueue`].
//!
//! # Safety
//!
//! Slots in `[head, tail)` are initialized; all others are not. Only the
//! producer writes `tail`, only the consumer writes `head`.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Largest supported capacity. Keeps `tail - head` comparisons unambiguous.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Shared ring storage.
pub(crate) struct SpscRing<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u32,
    /// Logical bound on `tail - head`; at most `mask + 1`.
    limit: u32,
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

// SAFETY: producer and consumer touch disjoint slots; the head/tail protocol
// hands each slot from one side to the other with Release/Acquire.
unsafe impl<T: Send> Sync for SpscRing<T> {}
unsafe impl<T: Send> Send for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring holding exactly `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds [`MAX_CAPACITY`].
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "SPSC capacity must be > 0");
        assert!(
            capacity <= MAX_CAPACITY,
            "SPSC capacity {capacity} exceeds {MAX_CAPACITY}"
        );
        let cap = capacity.next_power_of_two();
        let buf = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            mask: (cap - 1) as u32,
            limit: capacity as u32,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> u32 {
        self.limit
    }

    /// Items currently buffered. A snapshot; may be stale on return.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mut idx = head;
        while idx != tail {
            let slot = (idx & self.mask) as usize;
            // SAFETY: slots in [head, tail) are initialized and we have `&mut self`.
            unsafe { (*self.buf[slot].get()).assume_init_drop() };
            idx = idx.wrapping_add(1);
        }
    }
}

/// Producer half. `Send`, not `Sync`: one thread pushes at a time.
pub struct SpscProducer<T> {
    ring: Arc<SpscRing<T>>,
    cached_head: u32,
}

impl<T> SpscProducer<T> {
    /// Push `value`, or hand it back if the ring is full.
    #[inline]
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);

        if tail.wrapping_sub(self.cached_head) >= ring.capacity() {
            self.cached_head = ring.head.load(Ordering::Acquire);
            if tail.wrapping_sub(self.cached_head) >= ring.capacity() {
                return Err(value);
            }
        }

        let slot = (tail & ring.mask) as usize;
        // SAFETY: slot is outside [head, tail); the consumer will not read it
        // until the Release store below publishes it.
        unsafe { (*ring.buf[slot].get()).write(value) };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Items the ring accepts before rejecting.
    pub fn capacity(&self) -> usize {
        self.ring.capacity() as usize
    }
}

// SAFETY: the producer is only used through `&mut self`.
unsafe impl<T: Send> Send for SpscProducer<T> {}

/// Consumer half. `Send`, not `Sync`: one thread pops at a time.
pub struct SpscConsumer<T> {
    ring: Arc<SpscRing<T>>,
    cached_tail: u32,
}

impl<T> SpscConsumer<T> {
    /// Pop the oldest value, if any.
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);

        if head == self.cached_tail {
            self.cached_tail = ring.tail.load(Ordering::Acquire);
            if head == self.cached_tail {
                return None;
            }
        }

        let slot = (head & ring.mask) as usize;
        // SAFETY: slot is inside [head, tail) so it is initialized, and the
        // producer won't reuse it until head advances.
        let value = unsafe { (*ring.buf[slot].get()).assume_init_read() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Pop up to `max` values into `out`. Returns the number moved.
    ///
    /// Refreshes the producer index once, then advances `head` once.
    pub fn pop_into(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        self.cached_tail = ring.tail.load(Ordering::Acquire);

        let available = self.cached_tail.wrapping_sub(head) as usize;
        let count = available.min(max);
        out.reserve(count);
        for i in 0..count {
            let slot = (head.wrapping_add(i as u32) & ring.mask) as usize;
            // SAFETY: all slots in [head, head + count) are initialized.
            out.push(unsafe { (*ring.buf[slot].get()).assume_init_read() });
        }
        if count > 0 {
            ring.head
                .store(head.wrapping_add(count as u32), Ordering::Release);
        }
        count
    }

    /// Items currently buffered (snapshot).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// SAFETY: the consumer is only used through `&mut self`.
unsafe impl<T: Send> Send for SpscConsumer<T> {}

/// Create a ring with room for exactly `capacity` items.
///
/// ```ignore
/// let (mut tx, mut rx) = spsc_channel::<u64>(8);
/// tx.try_push(42).unwrap();
/// assert_eq!(rx.try_pop(), Some(42));
/// ```
pub fn spsc_channel<T>(capacity: usize) -> (SpscProducer<T>, SpscConsumer<T>) {
    let ring = Arc::new(SpscRing::with_capacity(capacity));
    (
        SpscProducer {
            ring: Arc::clone(&ring),
            cached_head: 0,
        },
        SpscConsumer {
            ring,
            cached_tail: 0,
        },
    )
}
