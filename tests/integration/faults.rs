//! Fault containment: a panicking hook tears its own slot down, runs
//! `shutdown` once, and is reported to `on_exception`. Siblings keep running.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tickrt::{
    AgentPerformer, Fault, FaultKind, FaultPhase, Parallel, SpawnOptions, TaskContext, Yield,
};

use crate::support::{config, wait_until};

#[derive(Default)]
struct Record {
    invokes: AtomicU32,
    shutdowns: AtomicU32,
}

struct Faulty {
    record: Arc<Record>,
    panic_on: u32,
}

impl AgentPerformer for Faulty {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        let n = self.record.invokes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.panic_on {
            panic!("boom on invoke five");
        }
        Yield::repeat()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.record.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct Steady {
    runs: Arc<AtomicU32>,
}

impl AgentPerformer for Steady {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        if self.runs.fetch_add(1, Ordering::SeqCst) >= 200 {
            return Yield::terminate();
        }
        Yield::repeat()
    }
}

fn collecting() -> (Arc<Mutex<Vec<Fault>>>, SpawnOptions) {
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let opts = SpawnOptions::default().on_exception(move |f| sink.lock().unwrap().push(f));
    (faults, opts)
}

#[test]
fn panic_in_invoke_is_contained_and_reported() {
    let rt = Parallel::new(config(1)).unwrap();
    let record = Arc::new(Record::default());
    let (faults, opts) = collecting();
    let agent = rt
        .spawn_with(
            Faulty {
                record: Arc::clone(&record),
                panic_on: 5,
            },
            SpawnOptions {
                name: Some("faulty".into()),
                ..opts
            },
        )
        .unwrap();
    let sibling_runs = Arc::new(AtomicU32::new(0));
    rt.spawn(Steady {
        runs: Arc::clone(&sibling_runs),
    })
    .unwrap();

    let snap = rt.join();
    assert_eq!(record.invokes.load(Ordering::SeqCst), 5);
    assert_eq!(record.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!agent.is_alive());
    assert_eq!(sibling_runs.load(Ordering::SeqCst), 201);
    assert_eq!(snap.faults, 1);

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    let f = &faults[0];
    assert_eq!(f.task, agent.id());
    assert_eq!(&*f.name, "faulty");
    assert_eq!(f.phase, FaultPhase::Invoke);
    assert_eq!(f.kind, FaultKind::Panic("boom on invoke five".into()));
    assert_eq!(f.payload_ref::<&str>(), Some(&"boom on invoke five"));
}

struct BadInit {
    record: Arc<Record>,
}

impl AgentPerformer for BadInit {
    fn initialize(&mut self, _cx: &mut TaskContext) {
        panic!("cannot connect");
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.record.invokes.fetch_add(1, Ordering::SeqCst);
        Yield::terminate()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.record.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn panic_in_initialize_still_runs_shutdown() {
    let rt = Parallel::new(config(1)).unwrap();
    let record = Arc::new(Record::default());
    let (faults, opts) = collecting();
    rt.spawn_with(
        BadInit {
            record: Arc::clone(&record),
        },
        opts,
    )
    .unwrap();
    rt.join();
    assert_eq!(record.invokes.load(Ordering::SeqCst), 0);
    assert_eq!(record.shutdowns.load(Ordering::SeqCst), 1);
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].phase, FaultPhase::Initialize);
    assert_eq!(faults[0].message(), "cannot connect");
}

struct Uninitialized;

impl AgentPerformer for Uninitialized {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        Yield::default()
    }
}

#[test]
fn uninitialized_yield_is_a_fault() {
    let rt = Parallel::new(config(1)).unwrap();
    let (faults, opts) = collecting();
    rt.spawn_with(Uninitialized, opts).unwrap();
    rt.join();
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::InvalidYield);
    assert!(faults[0].payload.is_none());
}

struct BadShutdown;

impl AgentPerformer for BadShutdown {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        Yield::terminate()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        std::panic::panic_any(String::from("flush failed"));
    }
}

#[test]
fn panic_in_shutdown_is_reported_once() {
    let rt = Parallel::new(config(1)).unwrap();
    let (faults, opts) = collecting();
    rt.spawn_with(BadShutdown, opts).unwrap();
    let snap = rt.join();
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].phase, FaultPhase::Shutdown);
    assert_eq!(faults[0].payload_ref::<String>().map(String::as_str), Some("flush failed"));
    assert_eq!(snap.terminated, 1);
}

#[test]
fn panicking_fault_handler_does_not_kill_the_worker() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.spawn_with(
        Uninitialized,
        SpawnOptions::default().on_exception(|_| panic!("handler exploded")),
    )
    .unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    rt.spawn(Steady {
        runs: Arc::clone(&runs),
    })
    .unwrap();
    wait_until("sibling finished", || runs.load(Ordering::SeqCst) > 200);
    rt.join();
}

#[test]
fn faults_without_a_handler_are_only_logged() {
    let rt = Parallel::new(config(1)).unwrap();
    let record = Arc::new(Record::default());
    rt.spawn(Faulty {
        record: Arc::clone(&record),
        panic_on: 1,
    })
    .unwrap();
    let snap = rt.join();
    assert_eq!(snap.faults, 1);
    assert_eq!(record.shutdowns.load(Ordering::SeqCst), 1);
}
