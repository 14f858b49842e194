//! Lease-tracking pool.
//!
//! [`PoolChecked`] hands out [`Pooled`] leases. Each lease carries the id of
//! its pool and the slot it occupies, so the pool can tell a legitimate
//! release from a lifetime bug:
//!
//! - releasing a slot that is not leased, or a stale copy of an earlier
//!   lease on a slot that has since been handed out again (double release),
//!   fails with [`PoolError::NotLeased`];
//! - releasing a lease from another pool fails with
//!   [`PoolError::ForeignInstance`];
//! - acquiring after [`PoolChecked::dispose`] fails with
//!   [`PoolError::Disposed`].
//!
//! Misuse is loud: every error is also logged at `error` level.
//!
//! Backing storage only grows when every existing slot is leased, so an
//! acquire/release loop runs at a fixed size.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PoolError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

type Factory<T> = Box<dyn Fn() -> T + Send + Sync + 'static>;

struct State<T> {
    free: Vec<(u32, T)>,
    /// `leased[slot]` is true while a lease for `slot` is outstanding.
    leased: Vec<bool>,
    /// Bumped on every acquire of `slot`; a lease must carry the current one.
    generation: Vec<u32>,
}

struct Inner<T> {
    id: u64,
    name: String,
    factory: Factory<T>,
    state: Mutex<State<T>>,
    disposed: AtomicBool,
}

/// Pool that tracks outstanding leases. Cloning yields another handle.
pub struct PoolChecked<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PoolChecked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A leased value. Hand it back with [`PoolChecked::release`].
///
/// Dropping a lease without releasing it leaks the slot; `dispose` reports
/// it as outstanding. Cloning a lease copies its identity, so releasing
/// both the original and the clone is a double release.
#[derive(Clone)]
pub struct Pooled<T> {
    pool_id: u64,
    slot: u32,
    generation: u32,
    value: T,
}

impl<T> Pooled<T> {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("slot", &self.slot)
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Send + 'static> PoolChecked<T> {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_factory(name.into(), Box::new(factory))
    }

    pub(crate) fn from_factory(name: String, factory: Factory<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                name,
                factory,
                state: Mutex::new(State {
                    free: Vec::new(),
                    leased: Vec::new(),
                    generation: Vec::new(),
                }),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a value, reusing a free slot when there is one.
    pub fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(self.misuse(PoolError::Disposed {
                pool: self.inner.name.clone(),
            }));
        }
        let mut st = self.lock();
        let (slot, value) = match st.free.pop() {
            Some(entry) => entry,
            None => {
                let slot = u32::try_from(st.leased.len()).unwrap_or(u32::MAX);
                st.leased.push(false);
                st.generation.push(0);
                (slot, (self.inner.factory)())
            }
        };
        let i = slot as usize;
        st.leased[i] = true;
        st.generation[i] = st.generation[i].wrapping_add(1);
        Ok(Pooled {
            pool_id: self.inner.id,
            slot,
            generation: st.generation[i],
            value,
        })
    }

    /// End a lease. After `dispose` the value is dropped instead of kept.
    pub fn release(&self, lease: Pooled<T>) -> Result<(), PoolError> {
        if lease.pool_id != self.inner.id {
            return Err(self.misuse(PoolError::ForeignInstance {
                pool: self.inner.name.clone(),
            }));
        }
        let mut st = self.lock();
        let slot = lease.slot;
        let current = st.leased.get(slot as usize).copied().unwrap_or(false)
            && st.generation[slot as usize] == lease.generation;
        if !current {
            drop(st);
            return Err(self.misuse(PoolError::NotLeased {
                pool: self.inner.name.clone(),
                slot,
            }));
        }
        st.leased[slot as usize] = false;
        if !self.inner.disposed.load(Ordering::Acquire) {
            st.free.push((slot, lease.value));
        }
        Ok(())
    }

    /// Stop leasing and drop cached values. Returns the number of leases
    /// still outstanding, which are reported as a warning.
    pub fn dispose(&self) -> usize {
        self.inner.disposed.store(true, Ordering::Release);
        let mut st = self.lock();
        st.free.clear();
        let outstanding = st.leased.iter().filter(|l| **l).count();
        if outstanding > 0 {
            tracing::warn!(
                pool = %self.inner.name,
                outstanding,
                "pool disposed with outstanding leases"
            );
        }
        outstanding
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().leased.iter().filter(|l| **l).count()
    }

    /// Slots ever created; the size of the backing storage.
    pub fn created(&self) -> usize {
        self.lock().leased.len()
    }

    fn misuse(&self, err: PoolError) -> PoolError {
        tracing::error!(pool = %self.inner.name, error = %err, "checked pool misuse");
        err
    }
}

impl<T> fmt::Debug for PoolChecked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolChecked")
            .field("name", &self.inner.name)
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
