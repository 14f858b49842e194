//! Error and fault types shared across the runtime.
//!
//! Three families live here:
//!
//! - [`ParallelError`]: runtime-level failures (gate closed, unknown performer,
//!   name collisions in the named factories).
//! - [`PoolError`]: checked-pool misuse. Always a lifetime bug in the caller.
//! - [`Fault`]: a unit fault captured on a worker. Faults are values, not
//!   errors: they are handed to the slot's fault handler and never cross a
//!   worker boundary any other way.
//!
//! Queue overflow errors live next to the queues (`queue::EnqueueError`)
//! because they hand the rejected value back to the producer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::scheduler::TaskId;
use crate::time::ClockMode;

/// Runtime-level errors returned by [`crate::ParallelHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ParallelError {
    #[error("runtime is not accepting new work (shutting down)")]
    ShuttingDown,
    #[error("worker {worker} out of range (runtime has {workers} workers)")]
    InvalidWorker { worker: usize, workers: usize },
    #[error("unknown performer `{0}`")]
    UnknownPerformer(String),
    #[error("no performer registered for type `{0}`")]
    UnregisteredType(&'static str),
    #[error("performer `{0}` is already registered")]
    DuplicatePerformer(String),
    #[error("performer `{name}` is registered as {actual}, not {expected}")]
    KindMismatch {
        name: String,
        expected: crate::scheduler::PerformerKind,
        actual: crate::scheduler::PerformerKind,
    },
    #[error("failed to construct performer `{name}`: {reason}")]
    Construct { name: String, reason: String },
    #[error("`{0}` is already registered with a different type")]
    TypeMismatch(String),
    #[error("operation requires Normal clock mode, runtime is in {0} mode")]
    WrongClockMode(ClockMode),
    #[error("callback marshaled onto worker {0} panicked")]
    ExecPanicked(usize),
    #[error("failed to spawn runtime thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Misuse of a [`crate::pool::PoolChecked`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool `{pool}`: slot {slot} released while not leased (double release)")]
    NotLeased { pool: String, slot: u32 },
    #[error("pool `{pool}`: released instance belongs to a different pool")]
    ForeignInstance { pool: String },
    #[error("pool `{pool}`: acquire after dispose")]
    Disposed { pool: String },
}

/// Lifecycle hook that was running when a fault escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FaultPhase {
    Initialize,
    Invoke,
    Shutdown,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultPhase::Initialize => "initialize",
            FaultPhase::Invoke => "invoke",
            FaultPhase::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// A panic escaped the hook. Carries the rendered panic message.
    Panic(String),
    /// The unit returned `Flow::None`.
    InvalidYield,
}

/// A unit fault captured on the owning worker.
///
/// The worker has already run `shutdown` for the slot by the time a `Fault`
/// reaches a handler; the slot identity in here is no longer live.
pub struct Fault {
    pub task: TaskId,
    pub name: Arc<str>,
    pub type_name: &'static str,
    pub worker: usize,
    pub phase: FaultPhase,
    pub kind: FaultKind,
    /// Original panic payload, when the fault came from a panic.
    pub payload: Option<Box<dyn Any + Send + 'static>>,
}

impl Fault {
    /// Human-readable description of the fault.
    pub fn message(&self) -> &str {
        match &self.kind {
            FaultKind::Panic(msg) => msg,
            FaultKind::InvalidYield => "unit returned an uninitialized yield",
        }
    }

    /// Downcast the original panic payload.
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("task", &self.task)
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("worker", &self.worker)
            .field("phase", &self.phase)
            .field("kind", &self.kind)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} `{}` ({}) faulted in {} on worker {}: {}",
            self.task,
            self.name,
            self.type_name,
            self.phase,
            self.worker,
            self.message()
        )
    }
}

/// Fault callback registered at spawn or loop creation.
pub type FaultHandler = Arc<dyn Fn(Fault) + Send + Sync + 'static>;

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
