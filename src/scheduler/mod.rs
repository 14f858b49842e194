//! Cooperative multitasking runtime.
//!
//! # Architecture
//!
//! Work units implement [`AgentPerformer`] and are bound to a slot on one of
//! N worker threads. Each worker is a single-threaded cooperative scheduler:
//! units are re-entered one at a time and say what happens next through the
//! [`Yield`] they return. A unit never blocks; waiting is expressed as
//! `Pause` (until notified), `DelayInvoke` (until a wake time or timer), or
//! idle `Repeat`.
//!
//! ```text
//! ParallelHandle ──spawn──▶ worker inbox ──▶ slot (Ready)
//!                                              │ invoke
//!                 ┌────────────┬───────────────┼──────────────┬──────────┐
//!                 ▼            ▼               ▼              ▼          ▼
//!              Invoke      Return/Repeat     Pause       DelayInvoke  Terminate
//!          (same tick,    (next cycle)   (notify/timer)  (deadline)   (shutdown
//!           budgeted)                                                  once)
//! ```
//!
//! # Guarantees
//!
//! - A slot runs on exactly one worker and is never invoked concurrently.
//! - `shutdown` runs exactly once per initialized slot, on every exit path.
//! - A panic in one unit's hook is contained to that slot and reported to
//!   its `on_exception` handler.
//! - Deadlines never fire early against the runtime clock.

mod agent;
mod context;
mod continuation;
mod executor;
mod executor_core;
mod io;
pub mod metrics;
mod performer;
mod registry;
mod starter;
pub(crate) mod task;
mod worker;
pub(crate) mod worker_id;
mod yield_policy;

pub use agent::{Agent, TaskId};
pub use context::TaskContext;
pub use continuation::{BoxedStep, Continuation, Flow, Method, Yield, YieldStatus};
pub use executor::{Parallel, ParallelConfig, ParallelHandle, SpawnOptions, TaskInfo};
pub use io::{IoTaskError, IoTicket};
pub use metrics::{Log2Hist, MetricsSnapshot, RuntimeStats, WorkerMetricsLocal, WorkerStats};
pub use performer::{AgentPerformer, LoopBody, Looper};
pub use registry::{PerformerKind, PerformerRegistry};
pub use starter::ParallelStarter;
pub use worker_id::{current_worker, WorkerTag};
pub use yield_policy::{EveryN, YieldPolicy};

