//! Cooperative multitasking runtime for tick-rate market data processing.
//!
//! ## Scope
//! Providers (feeds, gateways) and performers (strategies, risk) run as work
//! units on a small, fixed set of worker threads. Units never block: each
//! invocation returns a [`Yield`] that tells its worker what to do next.
//! Units talk to each other through bounded queues and wake each other with
//! edge-triggered notifies.
//!
//! ## Key invariants
//! - A unit runs on one worker only and is never invoked concurrently.
//! - `shutdown` runs exactly once per unit, on every exit path (normal
//!   terminate, runtime shutdown, panic in a hook).
//! - Queues are bounded, FIFO, and never drop silently: a full queue either
//!   rejects (handing the value back) or blocks, per queue.
//! - Deadlines and timers never fire before their time on the runtime clock.
//!   Under [`ClockMode::Normal`] the clock only moves when driven, so a
//!   replay is deterministic in time.
//!
//! ## Notable entry points
//! - [`Parallel`] / [`ParallelConfig`]: start and stop the runtime.
//! - [`ParallelHandle`]: spawn, address, timers, the clock, named queues and
//!   pools, introspection.
//! - [`AgentPerformer`] / [`Yield`]: the work-unit contract.
//! - [`ParallelStarter`]: run a bare closure as a unit.
//! - [`FastQueue`], [`TickQueue`], [`EventQueue`]: inter-unit queues.
//! - [`Pool`] / [`PoolChecked`]: object reuse.
//! - [`LevelSubscribers`]: runtime log level with explicit subscribers.

pub mod error;
pub mod log_level;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod stdx;
pub mod time;

pub use error::{Fault, FaultHandler, FaultKind, FaultPhase, ParallelError, PoolError};
pub use log_level::{LevelSubscribers, SubscriptionId};
pub use pool::{Pool, PoolChecked, PoolConfig, PoolStats, Pooled};
pub use queue::{
    EnqueueError, Event, EventQueue, FastEventQueue, FastFillQueue, FastQueue, Fill,
    OverflowPolicy, QueueStats, Side, SpscQueue, Tick, TickQueue,
};
pub use scheduler::{
    Agent, AgentPerformer, Continuation, Flow, IoTaskError, IoTicket, Looper, MetricsSnapshot,
    Parallel, ParallelConfig, ParallelHandle, ParallelStarter, PerformerKind, RuntimeStats,
    SpawnOptions, TaskContext, TaskId, TaskInfo, Yield, YieldStatus,
};
pub use time::{Clock, ClockMode, Timer, TimerEvent};
