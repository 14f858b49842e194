//! Slot identity and the opaque `Agent` handle.
//!
//! An [`Agent`] lets collaborators address a scheduled unit (wake it, ask it
//! to terminate, marshal a callback onto its worker) without touching the
//! unit itself. Handles are cheap to clone and never keep a slot alive: once
//! the slot is torn down, `is_alive` turns false and every operation becomes
//! a no-op.
//!
//! # Wake protocol
//!
//! Wakes are edge-triggered. Each slot has a `notified` flag:
//!
//! ```text
//! producer                         worker
//! --------                         ------
//! notify(): swap(true) == false?   before invoke: notified = false
//!   yes -> send Wake, unpark       invoke()
//!   no  -> nothing (already sent)  Pause -> idle until Wake arrives
//! ```
//!
//! A burst of N enqueues costs one wake command. A notify that lands during
//! an invocation is never lost: the flag was cleared before the call, so the
//! producer sends a fresh command and the slot is requeued next step.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use crossbeam_utils::sync::Unparker;

use super::task::Command;

/// Process-wide unique slot identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel into one worker's inbox.
#[derive(Clone)]
pub(crate) struct WorkerLink {
    pub(crate) tx: Sender<Command>,
    pub(crate) unparker: Unparker,
}

impl WorkerLink {
    /// Deliver `cmd` and wake the worker. `false` if the worker has exited.
    #[inline]
    pub(crate) fn send(&self, cmd: Command) -> bool {
        if self.tx.send(cmd).is_err() {
            return false;
        }
        self.unparker.unpark();
        true
    }
}

struct AgentInner {
    id: TaskId,
    worker: usize,
    name: Arc<str>,
    type_name: &'static str,
    notified: AtomicBool,
    alive: AtomicBool,
    terminating: AtomicBool,
    link: WorkerLink,
}

/// Opaque, cloneable handle to a scheduled unit.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub(crate) fn new(
        id: TaskId,
        worker: usize,
        name: Arc<str>,
        type_name: &'static str,
        link: WorkerLink,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                id,
                worker,
                name,
                type_name,
                notified: AtomicBool::new(false),
                alive: AtomicBool::new(true),
                terminating: AtomicBool::new(false),
                link,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Worker that owns the slot.
    #[inline]
    pub fn worker(&self) -> usize {
        self.inner.worker
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.inner.name)
    }

    /// Concrete type of the bound unit.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// `false` once the slot has been torn down.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Wake the slot if it is paused. Cheap when already notified.
    #[inline]
    pub fn notify(&self) {
        if !self.is_alive() {
            return;
        }
        if !self.inner.notified.swap(true, Ordering::AcqRel) {
            self.inner.link.send(Command::Wake(self.inner.id));
        }
    }

    /// Ask the owning worker to tear the slot down. Idempotent: only the
    /// first call has an effect, and calls on a dead slot do nothing.
    pub fn terminate(&self) {
        if !self.is_alive() || self.inner.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.link.send(Command::Terminate(self.inner.id));
    }

    /// Run `f` on the owning worker, between slot invocations.
    ///
    /// Returns `false` if the worker has exited.
    pub fn exec<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.link.send(Command::Exec(Box::new(f)))
    }

    /// Whether two handles refer to the same slot.
    pub fn same_slot(&self, other: &Agent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub(crate) fn send(&self, cmd: Command) -> bool {
        self.inner.link.send(cmd)
    }

    #[inline]
    pub(crate) fn clear_notified(&self) {
        self.inner.notified.store(false, Ordering::Release);
    }

    pub(crate) fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }
}

impl PartialEq for Agent {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Agent {}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("type_name", &self.inner.type_name)
            .field("worker", &self.inner.worker)
            .field("alive", &self.is_alive())
            .finish()
    }
}
