//! The `Parallel` runtime.
//!
//! # Architecture
//!
//! ```text
//!   collaborators ── ParallelHandle (clone) ──┐
//!                                             │ spawn / exec / timers / wake
//!                                             ▼
//!        ┌────────────────────────────────────────────────────────────┐
//!        │                        Shared                              │
//!        │  state (count<<1 | accepting)   clock   registry           │
//!        │  links[w] = inbox sender + unparker                        │
//!        │  tasks / by_addr   named queues / pools   stats cells      │
//!        └──────────┬──────────────────┬──────────────────┬───────────┘
//!                   ▼                  ▼                  ▼
//!            ┌────────────┐     ┌────────────┐     ┌────────────┐
//!            │  Worker 0  │     │  Worker 1  │     │  Worker N  │
//!            │ slab+ready │     │ slab+ready │     │ slab+ready │
//!            │ deadlines  │     │ deadlines  │     │ deadlines  │
//!            └────────────┘     └────────────┘     └────────────┘
//! ```
//!
//! - N worker threads, each an independent cooperative scheduler over the
//!   slots it owns. No stealing: a slot lives and dies on one worker.
//! - Everything that crosses threads goes through a worker's inbox
//!   (`crossbeam-channel`) and wakes it with an `Unparker`.
//! - Tiered idle: spin, then yield, then park with a timeout.
//!
//! # Lifecycle
//!
//! `Parallel::new` starts the workers. Collaborators get a cloneable
//! [`ParallelHandle`] (there is no global instance). `join` closes the gate
//! and waits for every slot to terminate on its own; `shutdown` closes the
//! gate and drains: every live slot has `shutdown` run exactly once, then
//! the workers exit. Dropping a `Parallel` that was neither joined nor shut
//! down performs a `shutdown`.

use std::any::{type_name, Any};
use std::fmt;
use std::mem::size_of;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded};
use crossbeam_utils::sync::Parker;
use crossbeam_utils::CachePadded;
use serde::de::DeserializeOwned;

use super::agent::{Agent, TaskId, WorkerLink};
use super::context::TaskContext;
use super::executor_core::{
    close_gate, decrement_count, in_flight, is_accepting, try_increment, try_increment_live,
    was_last_after_close, ACCEPTING_BIT,
};
use super::io::{IoPool, IoTicket};
use super::metrics::{MetricsSnapshot, RuntimeStats, WorkerMetricsLocal, WorkerStatsCell};
use super::performer::AgentPerformer;
use super::registry::{PerformerKind, PerformerRegistry};
use super::starter::ParallelStarter;
use super::task::{Bound, Command, Slot, SlotDriver};
use super::worker::Worker;
use super::worker_id::{current_worker_in, set_current_worker, WorkerTag};
use crate::error::{FaultHandler, ParallelError};
use crate::log_level::LevelSubscribers;
use crate::pool::{Pool, PoolChecked, PoolConfig};
use crate::queue::{
    EventQueue, FastEventQueue, FastFillQueue, FastQueue, OverflowPolicy, QueueProbe, QueueStats,
    SpscQueue, TickQueue,
};
use crate::time::{Clock, ClockMode, Timer, TimerEvent};

// ============================================================================
// Configuration
// ============================================================================

/// Runtime configuration.
///
/// | Knob            | Trade-off                                             |
/// |-----------------|-------------------------------------------------------|
/// | `workers`       | parallelism vs. cross-worker queue traffic            |
/// | `spin_iters`    | wake latency vs. CPU burned while idle                |
/// | `park_timeout`  | RealTime deadline precision vs. idle wakeups          |
/// | `invoke_budget` | tight-loop throughput vs. fairness to sibling slots   |
#[derive(Clone, Copy, Debug)]
pub struct ParallelConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Idle rounds spent spinning before a worker starts parking.
    pub spin_iters: u32,
    /// Upper bound on one park. Also bounds how late a RealTime deadline
    /// can be noticed by an otherwise idle worker.
    pub park_timeout: Duration,
    /// Same-tick `Invoke` re-entries allowed before the slot is requeued.
    pub invoke_budget: u64,
    /// Initial clock regime.
    pub mode: ClockMode,
    /// UTC instant of runtime time zero. `None` means "now".
    pub epoch: Option<DateTime<Utc>>,
    /// Deadlines further out than this wait in an overflow map.
    pub timer_horizon: Duration,
    /// Wheel entries per worker before spilling to the overflow map.
    pub timer_capacity: usize,
    /// Threads serving `release_io` jobs.
    pub io_threads: usize,
    /// Try to pin each worker to a core (requires the `affinity` feature).
    pub pin_threads: bool,
}

impl ParallelConfig {
    /// Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.workers > 0, "workers must be > 0");
        assert!(self.spin_iters > 0, "spin_iters must be > 0");
        assert!(self.park_timeout > Duration::ZERO, "park_timeout must be > 0");
        assert!(self.invoke_budget > 0, "invoke_budget must be > 0");
        assert!(self.timer_horizon > Duration::ZERO, "timer_horizon must be > 0");
        assert!(self.timer_capacity > 0, "timer_capacity must be > 0");
        assert!(self.io_threads > 0, "io_threads must be > 0");
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            spin_iters: 200,
            park_timeout: Duration::from_micros(200),
            invoke_budget: 64,
            mode: ClockMode::Normal,
            epoch: None,
            timer_horizon: Duration::from_secs(1),
            timer_capacity: 4096,
            io_threads: 2,
            pin_threads: false,
        }
    }
}

/// Per-spawn options.
#[derive(Clone, Default)]
pub struct SpawnOptions {
    /// Display name. Defaults to the unit's type name.
    pub name: Option<String>,
    /// Owning worker. Defaults to round-robin.
    pub worker: Option<usize>,
    /// Receives the fault if a hook panics.
    pub on_exception: Option<FaultHandler>,
}

impl SpawnOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn on_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn on_exception<F>(mut self, handler: F) -> Self
    where
        F: Fn(crate::error::Fault) + Send + Sync + 'static,
    {
        self.on_exception = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("name", &self.name)
            .field("worker", &self.worker)
            .field("on_exception", &self.on_exception.is_some())
            .finish()
    }
}

/// One live slot, as listed by [`ParallelHandle::tasks`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub type_name: &'static str,
    pub worker: usize,
}

// ============================================================================
// Shared state
// ============================================================================

struct NamedQueue {
    handle: Box<dyn Any + Send + Sync>,
    probe: Box<dyn QueueProbe>,
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) config: ParallelConfig,
    /// `(live_slots << 1) | accepting`; see `executor_core`.
    pub(crate) state: AtomicUsize,
    /// Once true, workers exit. Never cleared.
    pub(crate) done: AtomicBool,
    /// Set by `shutdown`; child spawns are refused from then on.
    draining: AtomicBool,
    pub(crate) links: Vec<WorkerLink>,
    next_worker: AtomicUsize,
    pub(crate) clock: Arc<Clock>,
    tasks: Mutex<AHashMap<TaskId, Agent>>,
    by_addr: Mutex<AHashMap<usize, Agent>>,
    registry: Mutex<PerformerRegistry>,
    queues: Mutex<AHashMap<String, NamedQueue>>,
    pools: Mutex<AHashMap<String, Box<dyn Any + Send + Sync>>>,
    pub(crate) stats: Vec<CachePadded<WorkerStatsCell>>,
    io: IoPool,
    log_levels: LevelSubscribers,
    next_timer: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn unpark_all(&self) {
        for link in &self.links {
            link.unparker.unpark();
        }
    }

    /// Signal all workers to stop.
    pub(crate) fn initiate_done(&self) {
        self.done.store(true, Ordering::Release);
        self.unpark_all();
    }

    /// Drop one live slot from the count; the last one after close ends
    /// the runtime.
    pub(crate) fn release_slot(&self) {
        if was_last_after_close(decrement_count(&self.state)) {
            self.initiate_done();
        }
    }

    /// Forget a torn-down slot in the addressing maps.
    pub(crate) fn unregister(&self, agent: &Agent, addr: Option<usize>) {
        lock(&self.tasks).remove(&agent.id());
        if let Some(addr) = addr {
            let mut by_addr = lock(&self.by_addr);
            if by_addr.get(&addr).is_some_and(|a| a.id() == agent.id()) {
                by_addr.remove(&addr);
            }
        }
    }
}

// ============================================================================
// ParallelHandle
// ============================================================================

/// Cloneable handle to a running [`Parallel`].
///
/// This is what collaborators hold: spawning, addressing, timers, the clock,
/// named queues and pools, and introspection all go through it.
#[derive(Clone)]
pub struct ParallelHandle {
    shared: Arc<Shared>,
}

impl ParallelHandle {
    /// Process-unique id of this runtime.
    pub fn runtime_id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.shared.config
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        is_accepting(self.shared.state.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    /// Bind `performer` to a new slot on a round-robin worker.
    pub fn spawn<P: AgentPerformer>(&self, performer: P) -> Result<Agent, ParallelError> {
        self.spawn_with(performer, SpawnOptions::default())
    }

    /// Bind `performer` to a new slot.
    ///
    /// `initialize` runs on the owning worker before the first `invoke`; the
    /// returned handle is usable immediately.
    ///
    /// # Errors
    ///
    /// - [`ParallelError::InvalidWorker`] if `opts.worker` is out of range.
    /// - [`ParallelError::ShuttingDown`] once `shutdown` started, or once
    ///   `join` started and the caller is not running on one of this
    ///   runtime's workers. Units may keep spawning children while `join`
    ///   waits for them.
    pub fn spawn_with<P: AgentPerformer>(
        &self,
        performer: P,
        opts: SpawnOptions,
    ) -> Result<Agent, ParallelError> {
        let shared = &self.shared;
        let workers = shared.links.len();
        let worker = match opts.worker {
            Some(w) if w >= workers => {
                return Err(ParallelError::InvalidWorker { worker: w, workers })
            }
            Some(w) => w,
            None => shared.next_worker.fetch_add(1, Ordering::Relaxed) % workers,
        };
        if !try_increment(&shared.state) && !self.admit_child() {
            return Err(ParallelError::ShuttingDown);
        }

        let type_name = type_name::<P>();
        let name: Arc<str> = match opts.name {
            Some(n) => Arc::from(n),
            None => Arc::from(short_type_name(type_name)),
        };
        let link = shared.links[worker].clone();
        let agent = Agent::new(TaskId::next(), worker, name, type_name, link.clone());

        let driver: Box<dyn SlotDriver> = Box::new(Bound::new(performer));
        let addr = driver.performer_addr();
        lock(&shared.tasks).insert(agent.id(), agent.clone());
        if let Some(addr) = addr {
            lock(&shared.by_addr).insert(addr, agent.clone());
        }

        let cx = TaskContext::new(agent.clone(), self.clone());
        let slot = Slot::new(agent.clone(), driver, cx, opts.on_exception);
        if !link.send(Command::Spawn(Box::new(slot))) {
            agent.mark_dead();
            shared.unregister(&agent, addr);
            shared.release_slot();
            return Err(ParallelError::ShuttingDown);
        }
        tracing::debug!(task = %agent.id(), name = agent.name(), worker, "spawned");
        Ok(agent)
    }

    /// Count a spawn made from a worker of this runtime after `join` closed
    /// the gate. The caller's own slot keeps the count above zero.
    fn admit_child(&self) -> bool {
        let shared = &self.shared;
        current_worker_in(shared.id).is_some()
            && !shared.draining.load(Ordering::Acquire)
            && try_increment_live(&shared.state)
    }

    /// Register a unit type under `name`, constructed from JSON arguments.
    pub fn register<P>(&self, name: &str, kind: PerformerKind) -> Result<(), ParallelError>
    where
        P: AgentPerformer + DeserializeOwned,
    {
        lock(&self.shared.registry).register::<P>(name, kind)
    }

    /// Register a unit type under `name` with a custom constructor.
    pub fn register_with<P, F>(&self, name: &str, kind: PerformerKind, ctor: F) -> Result<(), ParallelError>
    where
        P: AgentPerformer,
        F: Fn(serde_json::Value) -> Result<P, String> + Send + Sync + 'static,
    {
        lock(&self.shared.registry).register_with::<P, F>(name, kind, ctor)
    }

    /// Spawn a registered unit of kind [`PerformerKind::Performer`].
    pub fn spawn_performer(&self, name: &str, args: serde_json::Value) -> Result<Agent, ParallelError> {
        self.spawn_registered(name, Some(PerformerKind::Performer), SpawnOptions::named(name), args)
    }

    /// Spawn a registered unit of kind [`PerformerKind::Provider`].
    pub fn spawn_provider(&self, name: &str, args: serde_json::Value) -> Result<Agent, ParallelError> {
        self.spawn_registered(name, Some(PerformerKind::Provider), SpawnOptions::named(name), args)
    }

    /// Spawn a registered unit by name with explicit options, whatever its kind.
    pub fn spawn_named(
        &self,
        name: &str,
        opts: SpawnOptions,
        args: serde_json::Value,
    ) -> Result<Agent, ParallelError> {
        self.spawn_registered(name, None, opts, args)
    }

    /// Spawn the unit registered for type `P`.
    pub fn spawn_type<P: AgentPerformer>(&self, args: serde_json::Value) -> Result<Agent, ParallelError> {
        let name = lock(&self.shared.registry)
            .name_of::<P>()
            .ok_or(ParallelError::UnregisteredType(type_name::<P>()))?;
        self.spawn_registered(&name, None, SpawnOptions::named(name.clone()), args)
    }

    fn spawn_registered(
        &self,
        name: &str,
        expected: Option<PerformerKind>,
        opts: SpawnOptions,
        args: serde_json::Value,
    ) -> Result<Agent, ParallelError> {
        let (kind, factory) = lock(&self.shared.registry)
            .resolve(name)
            .ok_or_else(|| ParallelError::UnknownPerformer(name.to_string()))?;
        if let Some(expected) = expected {
            if expected != kind {
                return Err(ParallelError::KindMismatch {
                    name: name.to_string(),
                    expected,
                    actual: kind,
                });
            }
        }
        factory(self, opts, args)
    }

    /// Starter for closure-based units on this runtime.
    pub fn starter(&self) -> ParallelStarter {
        ParallelStarter::new(self.clone())
    }

    /// Registered names, sorted.
    pub fn registered(&self) -> Vec<(String, PerformerKind)> {
        lock(&self.shared.registry).entries()
    }

    // ------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------

    /// Handle of the slot that owns `performer`.
    ///
    /// Meant to be called by a unit on itself (`cx.runtime().get_agent(self)`)
    /// or on a unit it can otherwise reach. Zero-sized units have no unique
    /// address and always resolve to `None`.
    pub fn get_agent<P: AgentPerformer>(&self, performer: &P) -> Option<Agent> {
        if size_of::<P>() == 0 {
            return None;
        }
        let addr = performer as *const P as usize;
        lock(&self.shared.by_addr)
            .get(&addr)
            .filter(|a| a.type_name() == type_name::<P>())
            .cloned()
    }

    pub fn agent(&self, id: TaskId) -> Option<Agent> {
        lock(&self.shared.tasks).get(&id).cloned()
    }

    /// First live slot named `name` (lowest id).
    pub fn find_agent(&self, name: &str) -> Option<Agent> {
        lock(&self.shared.tasks)
            .values()
            .filter(|a| a.name() == name)
            .min_by_key(|a| a.id())
            .cloned()
    }

    /// Run `f` on `worker`, between slot invocations.
    pub fn exec<F>(&self, worker: usize, f: F) -> Result<(), ParallelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let link = self.link(worker)?;
        if link.send(Command::Exec(Box::new(f))) {
            Ok(())
        } else {
            Err(ParallelError::ShuttingDown)
        }
    }

    /// Run `f` on `worker` and wait for its result.
    ///
    /// Runs inline when already on that worker. Blocks the calling thread
    /// otherwise, so units should prefer [`Self::exec`]: two workers waiting
    /// on each other deadlock.
    pub fn exec_wait<R, F>(&self, worker: usize, f: F) -> Result<R, ParallelError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let link = self.link(worker)?;
        if current_worker_in(self.shared.id) == Some(worker) {
            return Ok(f());
        }
        let (tx, rx) = bounded(1);
        let job = Box::new(move || {
            let _ = tx.send(f());
        });
        if !link.send(Command::Exec(job)) {
            return Err(ParallelError::ShuttingDown);
        }
        rx.recv().map_err(|_| ParallelError::ExecPanicked(worker))
    }

    fn link(&self, worker: usize) -> Result<&WorkerLink, ParallelError> {
        self.shared
            .links
            .get(worker)
            .ok_or(ParallelError::InvalidWorker {
                worker,
                workers: self.shared.links.len(),
            })
    }

    // ------------------------------------------------------------------
    // Timers, I/O, clock
    // ------------------------------------------------------------------

    /// Timer that wakes `agent`'s slot when it fires.
    pub fn create_timer(&self, name: &str, agent: &Agent) -> Timer {
        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        Timer::new(id, name, agent.clone(), Arc::clone(&self.shared.clock), None)
    }

    /// Timer that runs `action` on `agent`'s worker, then wakes the slot.
    pub fn create_timer_with<F>(&self, name: &str, agent: &Agent, action: F) -> Timer
    where
        F: FnMut(&TimerEvent) + Send + 'static,
    {
        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        Timer::new(
            id,
            name,
            agent.clone(),
            Arc::clone(&self.shared.clock),
            Some(Box::new(action)),
        )
    }

    /// Run blocking `job` on the I/O pool; `agent` is notified on completion.
    pub fn release_io<R, F>(&self, agent: &Agent, job: F) -> IoTicket<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.io.submit(agent, job)
    }

    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    #[inline]
    pub fn mode(&self) -> ClockMode {
        self.shared.clock.mode()
    }

    /// Switch clock regime for the whole runtime. Returns the previous mode.
    pub fn set_mode(&self, mode: ClockMode) -> ClockMode {
        let prev = self.shared.clock.set_mode(mode);
        self.shared.unpark_all();
        prev
    }

    #[inline]
    pub fn micro_count(&self) -> u64 {
        self.shared.clock.micro_count()
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.shared.clock.tick_count()
    }

    pub fn utc_now(&self) -> DateTime<Utc> {
        self.shared.clock.utc_now()
    }

    /// Move simulated time to `us` and let workers fire what came due.
    pub fn advance_clock_to(&self, us: u64) -> Result<(), ParallelError> {
        if !self.shared.clock.advance_to(us) {
            return Err(ParallelError::WrongClockMode(self.mode()));
        }
        self.shared.unpark_all();
        Ok(())
    }

    pub fn advance_clock_by(&self, dt: Duration) -> Result<(), ParallelError> {
        if !self.shared.clock.advance_by(dt) {
            return Err(ParallelError::WrongClockMode(self.mode()));
        }
        self.shared.unpark_all();
        Ok(())
    }

    pub fn advance_clock_to_utc(&self, at: DateTime<Utc>) -> Result<(), ParallelError> {
        self.advance_clock_to(self.shared.clock.micros_at(at))
    }

    // ------------------------------------------------------------------
    // Named queues and pools
    // ------------------------------------------------------------------

    /// Named generic queue. A second call with the same name returns the
    /// existing queue (capacity and policy of the first call win).
    pub fn queue<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<FastQueue<T>, ParallelError> {
        self.named_queue(name, || {
            FastQueue::with_kind(name.to_string(), "FastQueue", capacity, policy)
        })
    }

    /// Single-producer tick queue; producers block when full.
    pub fn tick_queue(&self, name: &str, capacity: usize) -> Result<TickQueue, ParallelError> {
        self.named_queue(name, || {
            SpscQueue::with_kind(name.to_string(), "TickQueue", capacity, OverflowPolicy::Block)
        })
    }

    /// Fill queue; producers are rejected when full.
    pub fn fill_queue(&self, name: &str, capacity: usize) -> Result<FastFillQueue, ParallelError> {
        self.named_queue(name, || {
            FastQueue::with_kind(name.to_string(), "FastFillQueue", capacity, OverflowPolicy::Reject)
        })
    }

    /// Low-latency event queue; producers are rejected when full.
    pub fn fast_event_queue(&self, name: &str, capacity: usize) -> Result<FastEventQueue, ParallelError> {
        self.named_queue(name, || {
            FastQueue::with_kind(name.to_string(), "FastEventQueue", capacity, OverflowPolicy::Reject)
        })
    }

    /// Event queue; producers block when full.
    pub fn event_queue(&self, name: &str, capacity: usize) -> Result<EventQueue, ParallelError> {
        self.named_queue(name, || {
            FastQueue::with_kind(name.to_string(), "EventQueue", capacity, OverflowPolicy::Block)
        })
    }

    fn named_queue<Q, F>(&self, name: &str, make: F) -> Result<Q, ParallelError>
    where
        Q: QueueProbe + Clone + 'static,
        F: FnOnce() -> Q,
    {
        let mut queues = lock(&self.shared.queues);
        if let Some(existing) = queues.get(name) {
            return existing
                .handle
                .downcast_ref::<Q>()
                .cloned()
                .ok_or_else(|| ParallelError::TypeMismatch(name.to_string()));
        }
        let q = make();
        queues.insert(
            name.to_string(),
            NamedQueue {
                handle: Box::new(q.clone()),
                probe: Box::new(q.clone()),
            },
        );
        Ok(q)
    }

    /// Named reuse pool with per-worker caches.
    pub fn pool<T, F>(&self, name: &str, factory: F) -> Result<Pool<T>, ParallelError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.pool_with(name, PoolConfig::default(), factory)
    }

    pub fn pool_with<T, F>(&self, name: &str, cfg: PoolConfig, factory: F) -> Result<Pool<T>, ParallelError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let workers = self.shared.links.len();
        let runtime = self.shared.id;
        self.named_pool(name, || {
            Pool::for_runtime(name.to_string(), cfg, runtime, workers, Box::new(factory))
        })
    }

    /// Named lease-tracking pool.
    pub fn checked_pool<T, F>(&self, name: &str, factory: F) -> Result<PoolChecked<T>, ParallelError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.named_pool(name, || PoolChecked::from_factory(name.to_string(), Box::new(factory)))
    }

    fn named_pool<P, F>(&self, name: &str, make: F) -> Result<P, ParallelError>
    where
        P: Clone + Send + Sync + 'static,
        F: FnOnce() -> P,
    {
        let mut pools = lock(&self.shared.pools);
        if let Some(existing) = pools.get(name) {
            return existing
                .downcast_ref::<P>()
                .cloned()
                .ok_or_else(|| ParallelError::TypeMismatch(name.to_string()));
        }
        let p = make();
        pools.insert(name.to_string(), Box::new(p.clone()));
        Ok(p)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Live slots, ordered by id.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut out: Vec<TaskInfo> = lock(&self.shared.tasks)
            .values()
            .map(|a| TaskInfo {
                id: a.id(),
                name: a.name().to_string(),
                type_name: a.type_name(),
                worker: a.worker(),
            })
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    pub fn thread_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Live gauges as last published by each worker.
    pub fn stats(&self) -> RuntimeStats {
        let state = self.shared.state.load(Ordering::Acquire);
        RuntimeStats {
            mode: self.mode(),
            now_us: self.micro_count(),
            accepting: is_accepting(state),
            live_tasks: in_flight(state),
            workers: self
                .shared
                .stats
                .iter()
                .enumerate()
                .map(|(i, cell)| cell.read(i))
                .collect(),
        }
    }

    /// Stats of every named queue, ordered by name.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut out: Vec<QueueStats> = lock(&self.shared.queues)
            .values()
            .map(|q| q.probe.stats())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Runtime log level and its subscribers.
    pub fn log_levels(&self) -> &LevelSubscribers {
        &self.shared.log_levels
    }
}

impl fmt::Debug for ParallelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelHandle")
            .field("runtime", &self.shared.id)
            .field("workers", &self.shared.links.len())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// `"a::b::Quoter<c::D>"` -> `"Quoter"`.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ============================================================================
// Parallel
// ============================================================================

/// Owner of the worker threads.
///
/// Derefs to its [`ParallelHandle`], so `rt.spawn(..)` works directly.
pub struct Parallel {
    handle: ParallelHandle,
    threads: Vec<JoinHandle<WorkerMetricsLocal>>,
    started: Instant,
}

impl Parallel {
    /// Start the runtime. Workers park until work arrives.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid (see [`ParallelConfig::validate`]).
    pub fn new(config: ParallelConfig) -> Result<Self, ParallelError> {
        config.validate();

        let mut inboxes = Vec::with_capacity(config.workers);
        let mut parkers = Vec::with_capacity(config.workers);
        let mut links = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let (tx, rx) = unbounded();
            let parker = Parker::new();
            links.push(WorkerLink {
                tx,
                unparker: parker.unparker().clone(),
            });
            inboxes.push(rx);
            parkers.push(parker);
        }

        let epoch = config.epoch.unwrap_or_else(Utc::now);
        let shared = Arc::new(Shared {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            config,
            state: AtomicUsize::new(ACCEPTING_BIT),
            done: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            links,
            next_worker: AtomicUsize::new(0),
            clock: Arc::new(Clock::new(config.mode, epoch)),
            tasks: Mutex::new(AHashMap::new()),
            by_addr: Mutex::new(AHashMap::new()),
            registry: Mutex::new(PerformerRegistry::new()),
            queues: Mutex::new(AHashMap::new()),
            pools: Mutex::new(AHashMap::new()),
            stats: (0..config.workers)
                .map(|_| CachePadded::new(WorkerStatsCell::default()))
                .collect(),
            io: IoPool::new(config.io_threads)?,
            log_levels: LevelSubscribers::default(),
            next_timer: AtomicU64::new(1),
        });

        let mut threads = Vec::with_capacity(config.workers);
        for (worker_id, (inbox, parker)) in inboxes.into_iter().zip(parkers).enumerate() {
            let shared_w = Arc::clone(&shared);
            let name = format!("tickrt-worker-{worker_id}");
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                #[cfg(feature = "affinity")]
                if shared_w.config.pin_threads {
                    pin_current_thread(worker_id);
                }
                set_current_worker(Some(WorkerTag {
                    runtime: shared_w.id,
                    worker: worker_id,
                }));
                let mut worker = Worker::new(worker_id, shared_w, inbox, parker);
                worker.run();
                set_current_worker(None);
                worker.into_metrics()
            });
            match spawned {
                Ok(th) => threads.push(th),
                Err(source) => {
                    close_gate(&shared.state);
                    shared.initiate_done();
                    for th in threads {
                        let _ = th.join();
                    }
                    shared.io.close();
                    return Err(ParallelError::ThreadSpawn { name, source });
                }
            }
        }

        tracing::info!(
            runtime = shared.id,
            workers = config.workers,
            mode = %config.mode,
            "runtime started"
        );
        Ok(Self {
            handle: ParallelHandle { shared },
            threads,
            started: Instant::now(),
        })
    }

    pub fn handle(&self) -> ParallelHandle {
        self.handle.clone()
    }

    /// Stop accepting spawns and wait for every slot to terminate on its own.
    pub fn join(mut self) -> MetricsSnapshot {
        let prev = close_gate(&self.handle.shared.state);
        if in_flight(prev) == 0 {
            self.handle.shared.initiate_done();
        }
        self.collect()
    }

    /// Stop accepting spawns, tear every slot down (each `shutdown` runs
    /// exactly once), and wait for the workers to exit.
    pub fn shutdown(mut self) -> MetricsSnapshot {
        self.drain();
        self.collect()
    }

    fn drain(&self) {
        let shared = &self.handle.shared;
        shared.draining.store(true, Ordering::Release);
        let prev = close_gate(&shared.state);
        tracing::info!(
            runtime = shared.id,
            live = in_flight(prev),
            "runtime draining"
        );
        for link in &shared.links {
            link.send(Command::Drain);
        }
        if in_flight(shared.state.load(Ordering::Acquire)) == 0 {
            shared.initiate_done();
        }
    }

    fn collect(&mut self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for (worker, th) in self.threads.drain(..).enumerate() {
            match th.join() {
                Ok(m) => snapshot.merge_worker(&m),
                Err(_) => tracing::error!(worker, "worker thread panicked outside a slot"),
            }
        }
        self.handle.shared.io.close();
        snapshot.duration_ns = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        tracing::info!(
            runtime = self.handle.shared.id,
            invocations = snapshot.invocations,
            faults = snapshot.faults,
            "runtime stopped"
        );
        snapshot
    }
}

impl Deref for Parallel {
    type Target = ParallelHandle;

    fn deref(&self) -> &ParallelHandle {
        &self.handle
    }
}

impl Drop for Parallel {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.drain();
            self.collect();
        }
    }
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("handle", &self.handle)
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(feature = "affinity")]
fn pin_current_thread(worker_id: usize) {
    let cores = match core_affinity::get_core_ids() {
        Some(v) if !v.is_empty() => v,
        _ => {
            tracing::warn!(worker = worker_id, "no core ids available, skipping affinity");
            return;
        }
    };
    let core = cores[worker_id % cores.len()];
    if !core_affinity::set_for_current(core) {
        tracing::warn!(worker = worker_id, core = core.id, "failed to pin worker");
    }
}
