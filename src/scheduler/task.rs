//! Scheduling slots and the commands that drive them.
//!
//! A slot binds one work unit to one worker. The unit's concrete type is
//! erased behind [`SlotDriver`], so a worker can hold heterogeneous units in
//! one slab. [`Bound<P>`] is the only implementation: it owns the unit plus
//! the continuation it asked to resume at, and runs same-tick `Invoke`
//! chains under the worker's fairness budget.

use std::any::type_name;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use super::agent::{Agent, TaskId};
use super::context::TaskContext;
use super::continuation::{Continuation, Flow, YieldStatus};
use super::performer::AgentPerformer;
use super::yield_policy::{EveryN, YieldPolicy};
use crate::error::FaultHandler;
use crate::time::timer::TimerShared;

/// Message delivered to a worker's inbox.
pub(crate) enum Command {
    /// Bind a freshly spawned unit.
    Spawn(Box<Slot>),
    /// Edge-triggered wake from [`Agent::notify`].
    Wake(TaskId),
    Terminate(TaskId),
    /// Callback marshaled onto the worker.
    Exec(Box<dyn FnOnce() + Send + 'static>),
    ArmTimer {
        timer: Arc<TimerShared>,
        seq: u32,
        at_us: u64,
    },
    /// Tear every slot down and discard later spawns.
    Drain,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Spawn(slot) => f.debug_tuple("Spawn").field(&slot.agent.id()).finish(),
            Command::Wake(id) => f.debug_tuple("Wake").field(id).finish(),
            Command::Terminate(id) => f.debug_tuple("Terminate").field(id).finish(),
            Command::Exec(_) => f.write_str("Exec"),
            Command::ArmTimer { timer, seq, at_us } => f
                .debug_struct("ArmTimer")
                .field("timer", &timer.name())
                .field("seq", seq)
                .field("at_us", at_us)
                .finish(),
            Command::Drain => f.write_str("Drain"),
        }
    }
}

/// Outcome of one trip through a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InvokeStep {
    /// Final flow of the chain. `Invoke` means the fairness budget ran out
    /// with a continuation still pending.
    pub status: YieldStatus,
    /// Idle flag of the last call in the chain.
    pub is_idle: bool,
    /// Number of unit calls made.
    pub chain: u32,
}

/// Type-erased view of a bound unit.
pub(crate) trait SlotDriver: Send {
    fn initialize(&mut self, cx: &mut TaskContext);

    /// Call the pending continuation (or `invoke`) and follow `Invoke`
    /// re-entries until a different flow comes back or `budget` says yield.
    fn invoke(&mut self, cx: &mut TaskContext, budget: &mut EveryN) -> InvokeStep;

    fn shutdown(&mut self, cx: &mut TaskContext);

    /// Address of the unit, for [`super::ParallelHandle::get_agent`].
    /// `None` for zero-sized units, which have no unique address.
    fn performer_addr(&self) -> Option<usize>;

    fn type_name(&self) -> &'static str;
}

/// A unit together with its pending continuation.
pub(crate) struct Bound<P: AgentPerformer> {
    performer: P,
    pending: Option<Continuation<P>>,
}

impl<P: AgentPerformer> Bound<P> {
    pub(crate) fn new(performer: P) -> Self {
        Self {
            performer,
            pending: None,
        }
    }
}

impl<P: AgentPerformer> SlotDriver for Bound<P> {
    fn initialize(&mut self, cx: &mut TaskContext) {
        self.performer.initialize(cx);
    }

    fn invoke(&mut self, cx: &mut TaskContext, budget: &mut EveryN) -> InvokeStep {
        budget.reset();
        let mut next = self.pending.take();
        let mut chain = 0u32;
        loop {
            let y = match next.take() {
                Some(k) => k.call(&mut self.performer, cx),
                None => self.performer.invoke(cx),
            };
            chain = chain.saturating_add(1);
            let is_idle = y.is_idle;
            let status = match y.flow {
                Flow::Invoke(k) => {
                    if budget.should_yield(1) {
                        self.pending = Some(k);
                        YieldStatus::Invoke
                    } else {
                        next = Some(k);
                        continue;
                    }
                }
                Flow::DelayInvoke(k) => {
                    self.pending = Some(k);
                    YieldStatus::DelayInvoke
                }
                Flow::None => YieldStatus::None,
                Flow::Return => YieldStatus::Return,
                Flow::Repeat => YieldStatus::Repeat,
                Flow::Pause => YieldStatus::Pause,
                Flow::Terminate => YieldStatus::Terminate,
            };
            return InvokeStep {
                status,
                is_idle,
                chain,
            };
        }
    }

    fn shutdown(&mut self, cx: &mut TaskContext) {
        self.pending = None;
        self.performer.shutdown(cx);
    }

    fn performer_addr(&self) -> Option<usize> {
        if size_of::<P>() == 0 {
            None
        } else {
            Some(&self.performer as *const P as usize)
        }
    }

    fn type_name(&self) -> &'static str {
        type_name::<P>()
    }
}

/// Readiness of a slot on its worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// In the ready queue exactly once.
    Ready,
    /// Waiting for a notify or a timer.
    Paused,
    /// Holding a `DelayInvoke` continuation. With a deadline, only that
    /// deadline or a timer resolves it; without one, a notify also does.
    Delayed { deadline: Option<u64> },
}

/// One scheduling slot.
pub(crate) struct Slot {
    pub(crate) agent: Agent,
    pub(crate) driver: Box<dyn SlotDriver>,
    pub(crate) cx: TaskContext,
    pub(crate) state: SlotState,
    /// Generation of the current delay; stale deadlines carry an older one.
    pub(crate) delay_seq: u32,
    pub(crate) on_exception: Option<FaultHandler>,
}

impl Slot {
    pub(crate) fn new(
        agent: Agent,
        driver: Box<dyn SlotDriver>,
        cx: TaskContext,
        on_exception: Option<FaultHandler>,
    ) -> Self {
        Self {
            agent,
            driver,
            cx,
            state: SlotState::Ready,
            delay_seq: 0,
            on_exception,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> TaskId {
        self.agent.id()
    }
}
