//! Idle back-off and the blocking-I/O hand-off.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tickrt::{AgentPerformer, IoTaskError, IoTicket, Parallel, TaskContext, Yield};

use crate::support::config;

/// Reports "nothing to do" `left` times, then terminates.
struct IdlePoller {
    left: u32,
}

impl AgentPerformer for IdlePoller {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        if self.left == 0 {
            return Yield::terminate();
        }
        self.left -= 1;
        Yield::repeat().idle()
    }
}

#[test]
fn idle_repeats_let_the_worker_park() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.spawn(IdlePoller { left: 1_000 }).unwrap();
    let snap = rt.join();
    assert!(snap.idle_invocations >= 1_000);
    assert!(snap.park_count > 0);
}

struct BusyLoop {
    left: u32,
}

impl AgentPerformer for BusyLoop {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        if self.left == 0 {
            return Yield::terminate();
        }
        self.left -= 1;
        Yield::repeat()
    }
}

#[test]
fn busy_repeats_are_not_counted_idle() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.spawn(BusyLoop { left: 1_000 }).unwrap();
    let snap = rt.join();
    assert_eq!(snap.idle_invocations, 0);
    assert_eq!(snap.invocations, 1_001);
}

/// Offloads a blocking read, pauses, and picks the result up when woken.
struct Loader {
    ticket: Option<IoTicket<u64>>,
    result: Arc<Mutex<Option<Result<u64, IoTaskError>>>>,
    invokes: Arc<AtomicU32>,
    fail: bool,
}

impl AgentPerformer for Loader {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        match &self.ticket {
            None => {
                let fail = self.fail;
                self.ticket = Some(cx.release_io(move || {
                    thread::sleep(Duration::from_millis(10));
                    if fail {
                        panic!("disk gone");
                    }
                    42u64
                }));
                Yield::pause()
            }
            Some(ticket) => match ticket.try_take() {
                Some(r) => {
                    *self.result.lock().unwrap() = Some(r);
                    Yield::terminate()
                }
                None => Yield::pause().idle(),
            },
        }
    }
}

fn run_loader(fail: bool) -> (Option<Result<u64, IoTaskError>>, u32) {
    let rt = Parallel::new(config(1)).unwrap();
    let result = Arc::new(Mutex::new(None));
    let invokes = Arc::new(AtomicU32::new(0));
    rt.spawn(Loader {
        ticket: None,
        result: Arc::clone(&result),
        invokes: Arc::clone(&invokes),
        fail,
    })
    .unwrap();
    rt.join();
    let r = result.lock().unwrap().take();
    (r, invokes.load(Ordering::SeqCst))
}

#[test]
fn release_io_wakes_the_unit_with_the_result() {
    let (result, invokes) = run_loader(false);
    assert_eq!(result, Some(Ok(42)));
    assert_eq!(invokes, 2);
}

#[test]
fn release_io_panic_is_delivered_as_an_error() {
    let (result, _) = run_loader(true);
    assert_eq!(result, Some(Err(IoTaskError::Panicked("disk gone".into()))));
}
