//! Blocking I/O hand-off.
//!
//! Units must not block inside a hook. Work that has to (file reads, a
//! synchronous client call) goes to a small dedicated thread pool through
//! [`super::TaskContext::release_io`]; the unit returns `Pause` and is
//! notified when the result is ready.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use super::agent::Agent;
use crate::error::{panic_message, ParallelError};

type IoJob = Box<dyn FnOnce() + Send + 'static>;

/// Why an I/O job produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoTaskError {
    #[error("i/o job panicked: {0}")]
    Panicked(String),
    #[error("i/o pool is closed")]
    Closed,
    /// The result was already taken, or the job was dropped unrun.
    #[error("i/o result lost")]
    Lost,
}

/// Pending result of a [`super::TaskContext::release_io`] job.
#[derive(Debug)]
pub struct IoTicket<R> {
    rx: Receiver<Result<R, IoTaskError>>,
}

impl<R> IoTicket<R> {
    /// Take the result if the job finished. Returns `None` while running.
    ///
    /// A result can be taken once; later calls report [`IoTaskError::Lost`].
    pub fn try_take(&self) -> Option<Result<R, IoTaskError>> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(IoTaskError::Lost)),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }
}

pub(crate) struct IoPool {
    tx: Mutex<Option<Sender<IoJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl IoPool {
    pub(crate) fn new(threads: usize) -> Result<Self, ParallelError> {
        let (tx, rx) = unbounded::<IoJob>();
        let pool = Self {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(Vec::with_capacity(threads)),
        };
        for i in 0..threads {
            let rx = rx.clone();
            let name = format!("tickrt-io-{i}");
            let th = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .map_err(|source| {
                    pool.close();
                    ParallelError::ThreadSpawn { name, source }
                })?;
            pool.threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(th);
        }
        Ok(pool)
    }

    /// Queue `job`; `agent` is notified once the result is in the ticket.
    pub(crate) fn submit<R, F>(&self, agent: &Agent, job: F) -> IoTicket<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, rx) = bounded(1);
        let waiter = agent.clone();
        let wrapped: IoJob = Box::new(move || {
            let r = panic::catch_unwind(AssertUnwindSafe(job))
                .map_err(|p| IoTaskError::Panicked(panic_message(p.as_ref())));
            let _ = result_tx.send(r);
            waiter.notify();
        });

        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match guard.as_ref() {
            Some(tx) => tx.send(wrapped).is_ok(),
            None => false,
        };
        drop(guard);

        if !sent {
            // The wrapped job was dropped with its sender; report closure
            // through a fresh channel instead of a generic `Lost`.
            let (tx, rx) = bounded(1);
            let _ = tx.send(Err(IoTaskError::Closed));
            agent.notify();
            return IoTicket { rx };
        }
        IoTicket { rx }
    }

    /// Stop accepting jobs, finish the queued ones, join the threads.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for th in threads {
            if th.join().is_err() {
                tracing::error!("i/o thread panicked outside a job");
            }
        }
    }
}
