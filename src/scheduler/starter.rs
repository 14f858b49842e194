//! Convenience wrapper for running a bare closure as a work unit.

use super::agent::Agent;
use super::context::TaskContext;
use super::continuation::Yield;
use super::executor::{ParallelHandle, SpawnOptions};
use super::performer::Looper;
use crate::error::{FaultHandler, ParallelError};

/// Starts closures as [`Looper`] units.
#[derive(Clone, Debug)]
pub struct ParallelStarter {
    runtime: ParallelHandle,
}

impl ParallelStarter {
    pub fn new(runtime: ParallelHandle) -> Self {
        Self { runtime }
    }

    /// Spawn `body` as a unit named `creator`. The body runs under the same
    /// rules as any `invoke`: it must not block, and its flow decides when
    /// it runs again.
    pub fn run_loop<F>(
        &self,
        creator: &str,
        on_exception: Option<FaultHandler>,
        body: F,
    ) -> Result<Agent, ParallelError>
    where
        F: FnMut(&mut TaskContext) -> Yield<Looper> + Send + 'static,
    {
        let opts = SpawnOptions {
            name: Some(creator.to_string()),
            worker: None,
            on_exception,
        };
        self.runtime.spawn_with(Looper::new(creator, body), opts)
    }

    pub fn runtime(&self) -> &ParallelHandle {
        &self.runtime
    }
}
