//! The work-unit contract.
//!
//! A work unit implements [`AgentPerformer`] and is handed to the runtime,
//! which binds it to one slot on one worker. From then on:
//!
//! - `initialize` runs once, before any `invoke`;
//! - `invoke` runs repeatedly, only on the owning worker, never concurrently
//!   with itself or `shutdown`;
//! - `shutdown` runs exactly once after the last `invoke`, including when a
//!   hook panicked.
//!
//! Units never block inside a hook. "Nothing to do" is expressed with
//! `Yield::pause()` or `Yield::repeat().idle()`.

use std::fmt;

use super::context::TaskContext;
use super::continuation::Yield;

/// A cooperatively scheduled work unit.
pub trait AgentPerformer: Send + Sized + 'static {
    /// Bind to the slot and acquire resources. Default: no-op.
    fn initialize(&mut self, _cx: &mut TaskContext) {}

    /// Single re-entrant entry point.
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self>;

    /// One-time teardown. Default: no-op.
    fn shutdown(&mut self, _cx: &mut TaskContext) {}
}

/// Loop body driven by a [`Looper`].
pub type LoopBody = Box<dyn FnMut(&mut TaskContext) -> Yield<Looper> + Send + 'static>;

/// Work unit wrapping a bare continuation-returning closure.
///
/// Created by [`super::ParallelStarter::run_loop`]. The body may return any
/// flow; continuations that re-enter the body use [`Looper::resume`]:
///
/// ```ignore
/// starter.run_loop("poller", None, |cx| {
///     cx.delay(Duration::from_millis(5));
///     Yield::delay_invoke(Looper::resume)
/// })?;
/// ```
pub struct Looper {
    creator: String,
    body: LoopBody,
}

impl Looper {
    pub fn new<F>(creator: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&mut TaskContext) -> Yield<Looper> + Send + 'static,
    {
        Self {
            creator: creator.into(),
            body: Box::new(body),
        }
    }

    /// Name of the component that started the loop.
    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Continuation that re-enters the loop body.
    pub fn resume(&mut self, cx: &mut TaskContext) -> Yield<Looper> {
        (self.body)(cx)
    }
}

impl AgentPerformer for Looper {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        (self.body)(cx)
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("creator", &self.creator)
            .finish_non_exhaustive()
    }
}
