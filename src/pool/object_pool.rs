//! Lock-free reuse pool for hot-path values.
//!
//! # Routing
//!
//! ```text
//! acquire():
//!   1. this worker's local queue (when called on a runtime worker)
//!   2. global queue
//!   3. steal from other workers' local queues
//!   4. construct a fresh value with the factory
//!
//! release():
//!   1. reset hook (if any)
//!   2. this worker's local queue
//!   3. global queue
//!   4. drop (pool is at capacity)
//! ```
//!
//! Values move in and out by ownership, so two callers can never hold the
//! same instance. The pool never blocks and never fails: it grows by
//! constructing and sheds by dropping.
//!
//! Local queues are `CachePadded` so neighbouring workers do not bounce a
//! cache line on every release.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

use crate::scheduler::worker_id::current_worker_in;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync + 'static>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync + 'static>;

/// Sizing for a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Per-worker cache size. Keep small so one worker cannot hoard.
    pub local_capacity: usize,
    /// Shared reserve size; releases beyond it are dropped.
    pub global_capacity: usize,
}

impl PoolConfig {
    /// Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.local_capacity > 0, "local_capacity must be > 0");
        assert!(self.global_capacity > 0, "global_capacity must be > 0");
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            local_capacity: 16,
            global_capacity: 1024,
        }
    }
}

/// Counters for a [`Pool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    /// Releases dropped because every queue was full.
    pub discarded: u64,
    /// Values currently cached.
    pub available: usize,
}

struct Inner<T> {
    name: String,
    runtime: Option<u64>,
    global: ArrayQueue<T>,
    locals: Vec<CachePadded<ArrayQueue<T>>>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

/// Reuse pool. Cloning yields another handle to the same pool.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Standalone pool with only a global queue.
    pub fn new<F>(name: impl Into<String>, cfg: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(name.into(), cfg, None, 0, Box::new(factory), None)
    }

    /// Standalone pool that runs `reset` on every released value.
    pub fn with_reset<F, R>(name: impl Into<String>, cfg: PoolConfig, factory: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::build(name.into(), cfg, None, 0, Box::new(factory), Some(Box::new(reset)))
    }

    /// Pool with one local queue per worker of `runtime`.
    pub(crate) fn for_runtime(
        name: String,
        cfg: PoolConfig,
        runtime: u64,
        workers: usize,
        factory: Factory<T>,
    ) -> Self {
        Self::build(name, cfg, Some(runtime), workers, factory, None)
    }

    fn build(
        name: String,
        cfg: PoolConfig,
        runtime: Option<u64>,
        workers: usize,
        factory: Factory<T>,
        reset: Option<Reset<T>>,
    ) -> Self {
        cfg.validate();
        let locals = (0..workers)
            .map(|_| CachePadded::new(ArrayQueue::new(cfg.local_capacity)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                name,
                runtime,
                global: ArrayQueue::new(cfg.global_capacity),
                locals,
                factory,
                reset,
                created: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    fn local_index(&self) -> Option<usize> {
        let wid = current_worker_in(self.inner.runtime?)?;
        (wid < self.inner.locals.len()).then_some(wid)
    }

    /// A ready value: reused when one is cached, freshly built otherwise.
    pub fn acquire(&self) -> T {
        let inner = &self.inner;
        inner.acquired.fetch_add(1, Ordering::Relaxed);

        if let Some(wid) = self.local_index() {
            if let Some(v) = inner.locals[wid].pop() {
                return v;
            }
        }
        if let Some(v) = inner.global.pop() {
            return v;
        }
        for local in &inner.locals {
            if let Some(v) = local.pop() {
                return v;
            }
        }

        inner.created.fetch_add(1, Ordering::Relaxed);
        (inner.factory)()
    }

    /// Hand `value` back for reuse.
    pub fn release(&self, mut value: T) {
        let inner = &self.inner;
        inner.released.fetch_add(1, Ordering::Relaxed);
        if let Some(reset) = &inner.reset {
            reset(&mut value);
        }

        if let Some(wid) = self.local_index() {
            match inner.locals[wid].push(value) {
                Ok(()) => return,
                Err(returned) => value = returned,
            }
        }
        if inner.global.push(value).is_err() {
            inner.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Values currently cached across all queues.
    pub fn available(&self) -> usize {
        self.inner.global.len() + self.inner.locals.iter().map(|q| q.len()).sum::<usize>()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            created: inner.created.load(Ordering::Relaxed),
            acquired: inner.acquired.load(Ordering::Relaxed),
            released: inner.released.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
            available: self.available(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.locals.len())
            .field("created", &self.inner.created.load(Ordering::Relaxed))
            .finish()
    }
}
