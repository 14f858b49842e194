//! One worker thread's cooperative scheduler.
//!
//! # Step
//!
//! ```text
//! loop {
//!   done?            -> run leftover Exec callbacks, exit
//!   drain inbox      (spawn / wake / terminate / exec / arm timer / drain)
//!   fire deadlines   (DelayInvoke wakes, timers) at clock.micro_count()
//!   ready pass       (each slot queued at pass start runs at most once)
//!   progress?        -> reset idle
//!   else             -> spin / yield / park(timeout)
//! }
//! ```
//!
//! # Invariants
//!
//! - A slot is `Ready` iff it has exactly one entry in the ready queue.
//!   Entries carry the `TaskId` so a recycled slab index never runs the
//!   wrong slot.
//! - Teardown runs at most once per slot: the slot leaves the slab before
//!   `shutdown` is called.
//! - A hook panic is caught here and never crosses into another slot.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use crossbeam_channel::Receiver;
use crossbeam_utils::sync::Parker;

use super::agent::TaskId;
use super::continuation::YieldStatus;
use super::executor::Shared;
use super::executor_core::{IdleAction, IdleHooks, TieredIdle, WorkerStepResult};
use super::metrics::{WorkerGauges, WorkerMetricsLocal};
use super::task::{Command, Slot, SlotState};
use super::yield_policy::EveryN;
use crate::error::{panic_message, Fault, FaultKind, FaultPhase};
use crate::time::timer::{Deadline, Deadlines, TimerShared};

/// Steps between stats publications while busy.
const PUBLISH_EVERY: u32 = 256;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Why a slot is being torn down abnormally.
struct Failure {
    phase: FaultPhase,
    kind: FaultKind,
    payload: Option<PanicPayload>,
}

impl Failure {
    fn panic(phase: FaultPhase, payload: PanicPayload) -> Self {
        Self {
            phase,
            kind: FaultKind::Panic(panic_message(&*payload)),
            payload: Some(payload),
        }
    }
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    inbox: Receiver<Command>,
    parker: Parker,

    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    by_id: AHashMap<TaskId, u32>,
    ready: VecDeque<(u32, TaskId)>,

    deadlines: Deadlines,
    due: Vec<Deadline>,
    /// Armed timers, with the number of wheel entries still referencing each.
    timers: AHashMap<u64, (Arc<TimerShared>, u32)>,

    budget: EveryN,
    draining: bool,
    metrics: WorkerMetricsLocal,
    since_publish: u32,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>, inbox: Receiver<Command>, parker: Parker) -> Self {
        let cfg = shared.config;
        Self {
            id,
            inbox,
            parker,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: AHashMap::new(),
            ready: VecDeque::new(),
            deadlines: Deadlines::new(cfg.timer_horizon, cfg.timer_capacity),
            due: Vec::new(),
            timers: AHashMap::new(),
            budget: EveryN::new(cfg.invoke_budget),
            draining: false,
            metrics: WorkerMetricsLocal::default(),
            since_publish: 0,
            shared,
        }
    }

    pub(crate) fn into_metrics(self) -> WorkerMetricsLocal {
        self.metrics
    }

    pub(crate) fn run(&mut self) {
        let cfg = self.shared.config;
        let mut idle = TieredIdle::new(cfg.spin_iters, cfg.park_timeout);
        tracing::debug!(worker = self.id, "worker started");
        loop {
            match self.step(&mut idle) {
                WorkerStepResult::Progress | WorkerStepResult::NoWork => {}
                WorkerStepResult::ShouldPark { timeout } => {
                    self.metrics.park_count += 1;
                    self.publish();
                    self.parker.park_timeout(timeout);
                }
                WorkerStepResult::ExitDone => break,
            }
        }
        self.finish();
        tracing::debug!(
            worker = self.id,
            invocations = self.metrics.invocations,
            parks = self.metrics.park_count,
            "worker exited"
        );
    }

    fn step(&mut self, idle: &mut TieredIdle) -> WorkerStepResult {
        if self.shared.done.load(Ordering::Acquire) {
            return WorkerStepResult::ExitDone;
        }

        let mut progress = self.drain_inbox();
        progress |= self.fire_deadlines();
        progress |= self.run_ready_pass();

        self.since_publish += 1;
        if self.since_publish >= PUBLISH_EVERY {
            self.publish();
        }

        if progress {
            idle.on_work();
            return WorkerStepResult::Progress;
        }
        if self.shared.done.load(Ordering::Acquire) {
            return WorkerStepResult::ExitDone;
        }
        match idle.on_idle() {
            IdleAction::Continue => {
                self.metrics.idle_spins += 1;
                WorkerStepResult::NoWork
            }
            IdleAction::Park { timeout } => WorkerStepResult::ShouldPark { timeout },
        }
    }

    /// Runs once after the loop. Leftover callbacks still execute so
    /// `exec_wait` callers are answered; leftover spawns were never counted
    /// live past close and are discarded.
    fn finish(&mut self) {
        while let Ok(cmd) = self.inbox.try_recv() {
            match cmd {
                Command::Exec(f) => self.run_exec(f),
                Command::Spawn(slot) => self.discard(*slot),
                _ => {}
            }
        }
        let live: Vec<u32> = self.by_id.values().copied().collect();
        for idx in live {
            self.teardown(idx, None);
        }
        self.deadlines.clear();
        self.timers.clear();
        self.publish();
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    fn drain_inbox(&mut self) -> bool {
        let mut any = false;
        while let Ok(cmd) = self.inbox.try_recv() {
            any = true;
            self.metrics.commands += 1;
            match cmd {
                Command::Spawn(slot) => self.admit(*slot),
                Command::Wake(id) => self.wake(id),
                Command::Terminate(id) => {
                    if let Some(&idx) = self.by_id.get(&id) {
                        self.teardown(idx, None);
                    }
                }
                Command::Exec(f) => self.run_exec(f),
                Command::ArmTimer { timer, seq, at_us } => {
                    let id = timer.id;
                    self.timers.entry(id).or_insert_with(|| (timer, 0)).1 += 1;
                    self.deadlines.push(Deadline::Timer { id, seq, at: at_us });
                }
                Command::Drain => self.drain_all(),
            }
        }
        any
    }

    fn admit(&mut self, slot: Slot) {
        if self.draining {
            self.discard(slot);
            return;
        }
        let id = slot.id();
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        self.by_id.insert(id, idx);
        self.metrics.spawned += 1;

        let Some(slot) = self.slots[idx as usize].as_mut() else {
            return;
        };
        let init = catch_unwind(AssertUnwindSafe(|| slot.driver.initialize(&mut slot.cx)));
        match init {
            Ok(()) => {
                slot.state = SlotState::Ready;
                self.ready.push_back((idx, id));
            }
            Err(payload) => self.teardown(idx, Some(Failure::panic(FaultPhase::Initialize, payload))),
        }
    }

    /// Drop a slot that never got to initialize.
    fn discard(&mut self, slot: Slot) {
        tracing::debug!(task = %slot.id(), name = slot.agent.name(), "spawn discarded while draining");
        slot.agent.mark_dead();
        self.shared.unregister(&slot.agent, slot.driver.performer_addr());
        self.shared.release_slot();
    }

    fn wake(&mut self, id: TaskId) {
        let Some(&idx) = self.by_id.get(&id) else {
            return;
        };
        let wakeable = self.slots[idx as usize].as_ref().is_some_and(|s| {
            matches!(
                s.state,
                SlotState::Paused | SlotState::Delayed { deadline: None }
            )
        });
        if wakeable {
            self.make_ready(idx);
        }
    }

    fn run_exec(&mut self, f: Box<dyn FnOnce() + Send + 'static>) {
        self.metrics.execs += 1;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            tracing::error!(
                worker = self.id,
                panic = %panic_message(&*payload),
                "exec callback panicked"
            );
        }
    }

    fn drain_all(&mut self) {
        self.draining = true;
        let live: Vec<u32> = self.by_id.values().copied().collect();
        tracing::debug!(worker = self.id, slots = live.len(), "draining");
        for idx in live {
            self.teardown(idx, None);
        }
    }

    // ------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------

    fn fire_deadlines(&mut self) -> bool {
        if self.deadlines.len() == 0 {
            return false;
        }
        let now = self.shared.clock.micro_count();
        let mut due = std::mem::take(&mut self.due);
        self.deadlines.drain_due(now, &mut due);
        let fired = !due.is_empty();
        for d in due.drain(..) {
            match d {
                Deadline::Slot { index, task, seq, .. } => {
                    let current = self.slots.get(index as usize).and_then(Option::as_ref).is_some_and(|s| {
                        s.id() == task
                            && s.delay_seq == seq
                            && matches!(s.state, SlotState::Delayed { .. })
                    });
                    if current {
                        self.metrics.delays_fired += 1;
                        self.make_ready(index);
                    }
                }
                Deadline::Timer { id, seq, at } => self.fire_timer(id, seq, at, now),
            }
        }
        self.due = due;
        fired
    }

    fn fire_timer(&mut self, id: u64, seq: u32, scheduled_us: u64, now: u64) {
        let Some(entry) = self.timers.get_mut(&id) else {
            return;
        };
        let timer = Arc::clone(&entry.0);
        entry.1 -= 1;
        if entry.1 == 0 {
            self.timers.remove(&id);
        }

        let task = timer.task();
        let outcome = catch_unwind(AssertUnwindSafe(|| timer.fire(seq, scheduled_us, now)));
        let Some(&idx) = self.by_id.get(&task) else {
            return;
        };
        match outcome {
            Ok(false) => {}
            Ok(true) => {
                self.metrics.timers_fired += 1;
                let waiting = self.slots[idx as usize].as_ref().is_some_and(|s| {
                    matches!(s.state, SlotState::Paused | SlotState::Delayed { .. })
                });
                if waiting {
                    self.make_ready(idx);
                }
            }
            Err(payload) => {
                tracing::warn!(timer = timer.name(), task = %task, "timer action panicked");
                self.teardown(idx, Some(Failure::panic(FaultPhase::Invoke, payload)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Ready pass
    // ------------------------------------------------------------------

    fn make_ready(&mut self, idx: u32) {
        if let Some(slot) = self.slots[idx as usize].as_mut() {
            if slot.state != SlotState::Ready {
                slot.state = SlotState::Ready;
                self.ready.push_back((idx, slot.id()));
            }
        }
    }

    fn run_ready_pass(&mut self) -> bool {
        let mut progress = false;
        for _ in 0..self.ready.len() {
            let Some((idx, id)) = self.ready.pop_front() else {
                break;
            };
            let runnable = self.slots[idx as usize]
                .as_ref()
                .is_some_and(|s| s.id() == id && s.state == SlotState::Ready);
            if runnable {
                progress |= self.run_slot(idx, id);
            }
        }
        progress
    }

    /// Invoke one slot and apply the flow it returned. Returns whether the
    /// invocation counts as progress.
    fn run_slot(&mut self, idx: u32, id: TaskId) -> bool {
        let Some(slot) = self.slots[idx as usize].as_mut() else {
            return false;
        };
        slot.agent.clear_notified();
        let _ = slot.cx.take_wake_at();

        let budget = &mut self.budget;
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| slot.driver.invoke(&mut slot.cx, budget)));
        let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.metrics.invoke_time_ns.record(elapsed);

        let step = match result {
            Ok(step) => step,
            Err(payload) => {
                self.metrics.invocations += 1;
                self.teardown(idx, Some(Failure::panic(FaultPhase::Invoke, payload)));
                return true;
            }
        };
        self.metrics.invocations += u64::from(step.chain);
        self.metrics.invoke_chain.record(u64::from(step.chain));
        if step.is_idle {
            self.metrics.idle_invocations += 1;
        }

        match step.status {
            YieldStatus::Invoke => {
                self.metrics.budget_yields += 1;
                self.ready.push_back((idx, id));
            }
            YieldStatus::Return | YieldStatus::Repeat => self.ready.push_back((idx, id)),
            YieldStatus::Pause => slot.state = SlotState::Paused,
            YieldStatus::DelayInvoke => {
                let wake_at = slot.cx.take_wake_at();
                slot.delay_seq = slot.delay_seq.wrapping_add(1);
                slot.state = SlotState::Delayed { deadline: wake_at };
                if let Some(at) = wake_at {
                    self.deadlines.push(Deadline::Slot {
                        index: idx,
                        task: id,
                        seq: slot.delay_seq,
                        at,
                    });
                }
            }
            YieldStatus::Terminate => {
                self.teardown(idx, None);
                return true;
            }
            YieldStatus::None => {
                self.teardown(
                    idx,
                    Some(Failure {
                        phase: FaultPhase::Invoke,
                        kind: FaultKind::InvalidYield,
                        payload: None,
                    }),
                );
                return true;
            }
        }
        !step.is_idle
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove the slot, run `shutdown` once, report any fault, and release
    /// the slot's share of the live count.
    fn teardown(&mut self, idx: u32, failure: Option<Failure>) {
        let Some(mut slot) = self.slots.get_mut(idx as usize).and_then(Option::take) else {
            return;
        };
        self.free.push(idx);
        self.by_id.remove(&slot.id());

        let shut = catch_unwind(AssertUnwindSafe(|| slot.driver.shutdown(&mut slot.cx)));
        let mut failure = failure;
        if let Err(payload) = shut {
            if failure.is_none() {
                failure = Some(Failure::panic(FaultPhase::Shutdown, payload));
            } else {
                tracing::error!(
                    task = %slot.id(),
                    name = slot.agent.name(),
                    panic = %panic_message(&*payload),
                    "shutdown panicked after an earlier fault"
                );
            }
        }

        slot.agent.mark_dead();
        self.shared.unregister(&slot.agent, slot.driver.performer_addr());
        self.metrics.terminated += 1;

        match failure {
            Some(f) => self.report(&slot, f),
            None => tracing::debug!(task = %slot.id(), name = slot.agent.name(), "slot terminated"),
        }
        drop(slot);
        self.shared.release_slot();
    }

    fn report(&mut self, slot: &Slot, failure: Failure) {
        self.metrics.faults += 1;
        let fault = Fault {
            task: slot.id(),
            name: slot.agent.name_arc(),
            type_name: slot.driver.type_name(),
            worker: self.id,
            phase: failure.phase,
            kind: failure.kind,
            payload: failure.payload,
        };
        tracing::error!(
            task = %fault.task,
            name = %fault.name,
            type_name = fault.type_name,
            phase = %fault.phase,
            "{}",
            fault.message()
        );
        if let Some(handler) = slot.on_exception.as_ref() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(fault))) {
                tracing::error!(
                    task = %slot.id(),
                    panic = %panic_message(&*payload),
                    "fault handler panicked"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    fn publish(&mut self) {
        self.since_publish = 0;
        let mut g = WorkerGauges {
            slots: self.by_id.len() as u64,
            deadlines: self.deadlines.len() as u64,
            ..WorkerGauges::default()
        };
        for slot in self.slots.iter().flatten() {
            match slot.state {
                SlotState::Ready => g.ready += 1,
                SlotState::Paused => g.paused += 1,
                SlotState::Delayed { .. } => g.delayed += 1,
            }
        }
        self.shared.stats[self.id].publish(g, &self.metrics);
    }
}
