//! The continuation protocol.
//!
//! Every invocation of a work unit returns a [`Yield`]: a [`Flow`] telling the
//! worker what to do with the slot next, plus an `is_idle` flag telling it
//! whether the invocation did useful work. The two are independent:
//! `Repeat` + idle means "nothing yet, check again", and feeds the worker's
//! back-off decision.
//!
//! | Flow          | Worker action                                              |
//! |---------------|------------------------------------------------------------|
//! | `Invoke`      | re-enter the continuation this tick (bounded per tick)     |
//! | `DelayInvoke` | park the continuation until the slot's wake time or timer  |
//! | `Return`      | requeue for the next cycle                                 |
//! | `Repeat`      | requeue for the next cycle                                 |
//! | `Pause`       | idle until woken by a notify or timer                      |
//! | `Terminate`   | tear down; `shutdown` runs exactly once                    |
//! | `None`        | treated as a unit fault                                    |
//!
//! Continuations are either a plain method (`fn(&mut P, &mut TaskContext)`,
//! no allocation) or a boxed closure carrying its own state.

use std::fmt;

use super::context::TaskContext;

/// Plain-method continuation.
pub type Method<P> = fn(&mut P, &mut TaskContext) -> Yield<P>;

/// Closure continuation.
pub type BoxedStep<P> = Box<dyn FnOnce(&mut P, &mut TaskContext) -> Yield<P> + Send + 'static>;

/// Something the worker can call to re-enter a unit.
pub enum Continuation<P> {
    Method(Method<P>),
    Boxed(BoxedStep<P>),
}

impl<P> Continuation<P> {
    #[inline]
    pub(crate) fn call(self, performer: &mut P, cx: &mut TaskContext) -> Yield<P> {
        match self {
            Continuation::Method(f) => f(performer, cx),
            Continuation::Boxed(f) => f(performer, cx),
        }
    }
}

impl<P> From<Method<P>> for Continuation<P> {
    fn from(f: Method<P>) -> Self {
        Continuation::Method(f)
    }
}

impl<P> fmt::Debug for Continuation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Method(_) => f.write_str("Continuation::Method"),
            Continuation::Boxed(_) => f.write_str("Continuation::Boxed"),
        }
    }
}

/// What the worker does with the slot after an invocation.
pub enum Flow<P> {
    /// Uninitialized. Never returned by a correct unit.
    None,
    Invoke(Continuation<P>),
    DelayInvoke(Continuation<P>),
    Return,
    Repeat,
    Pause,
    Terminate,
}

/// Payload-free mirror of [`Flow`], for stats and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum YieldStatus {
    None,
    Invoke,
    DelayInvoke,
    Return,
    Repeat,
    Pause,
    Terminate,
}

impl<P> Default for Flow<P> {
    fn default() -> Self {
        Flow::None
    }
}

impl<P> fmt::Debug for Flow<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Invoke(k) => f.debug_tuple("Invoke").field(k).finish(),
            Flow::DelayInvoke(k) => f.debug_tuple("DelayInvoke").field(k).finish(),
            Flow::None => f.write_str("None"),
            Flow::Return => f.write_str("Return"),
            Flow::Repeat => f.write_str("Repeat"),
            Flow::Pause => f.write_str("Pause"),
            Flow::Terminate => f.write_str("Terminate"),
        }
    }
}

/// Result of one invocation.
#[must_use = "a Yield tells the worker what to do with the slot"]
pub struct Yield<P> {
    pub flow: Flow<P>,
    pub is_idle: bool,
}

impl<P> fmt::Debug for Yield<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Yield")
            .field("flow", &self.flow)
            .field("is_idle", &self.is_idle)
            .finish()
    }
}

impl<P> Default for Yield<P> {
    fn default() -> Self {
        Self {
            flow: Flow::None,
            is_idle: false,
        }
    }
}

impl<P> Yield<P> {
    #[inline]
    fn with(flow: Flow<P>) -> Self {
        Self {
            flow,
            is_idle: false,
        }
    }

    /// Re-enter `method` within the current tick.
    #[inline]
    pub fn invoke(method: Method<P>) -> Self {
        Self::with(Flow::Invoke(Continuation::Method(method)))
    }

    /// Re-enter a closure within the current tick.
    pub fn invoke_with<F>(f: F) -> Self
    where
        F: FnOnce(&mut P, &mut TaskContext) -> Yield<P> + Send + 'static,
    {
        Self::with(Flow::Invoke(Continuation::Boxed(Box::new(f))))
    }

    /// Re-enter `method` once the slot's wake time passes (see
    /// [`TaskContext::delay`]) or a timer bound to the slot fires.
    #[inline]
    pub fn delay_invoke(method: Method<P>) -> Self {
        Self::with(Flow::DelayInvoke(Continuation::Method(method)))
    }

    pub fn delay_invoke_with<F>(f: F) -> Self
    where
        F: FnOnce(&mut P, &mut TaskContext) -> Yield<P> + Send + 'static,
    {
        Self::with(Flow::DelayInvoke(Continuation::Boxed(Box::new(f))))
    }

    #[inline]
    pub fn ret() -> Self {
        Self::with(Flow::Return)
    }

    #[inline]
    pub fn repeat() -> Self {
        Self::with(Flow::Repeat)
    }

    #[inline]
    pub fn pause() -> Self {
        Self::with(Flow::Pause)
    }

    #[inline]
    pub fn terminate() -> Self {
        Self::with(Flow::Terminate)
    }

    /// Mark this invocation as having done no useful work.
    #[inline]
    pub fn idle(mut self) -> Self {
        self.is_idle = true;
        self
    }

    #[inline]
    pub fn with_idle(mut self, is_idle: bool) -> Self {
        self.is_idle = is_idle;
        self
    }

    pub fn status(&self) -> YieldStatus {
        match self.flow {
            Flow::None => YieldStatus::None,
            Flow::Invoke(_) => YieldStatus::Invoke,
            Flow::DelayInvoke(_) => YieldStatus::DelayInvoke,
            Flow::Return => YieldStatus::Return,
            Flow::Repeat => YieldStatus::Repeat,
            Flow::Pause => YieldStatus::Pause,
            Flow::Terminate => YieldStatus::Terminate,
        }
    }
}
