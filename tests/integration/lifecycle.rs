//! Slot lifecycle: initialize -> invoke* -> shutdown, exactly once, on every
//! exit path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tickrt::scheduler::current_worker;
use tickrt::{AgentPerformer, Parallel, ParallelError, SpawnOptions, TaskContext, Yield};

use crate::support::{config, wait_until};

#[derive(Default)]
struct Hooks {
    inits: AtomicU32,
    invokes: AtomicU32,
    shutdowns: AtomicU32,
}

/// Pauses forever; only a terminate or runtime shutdown ends it.
struct Sleeper {
    hooks: Arc<Hooks>,
}

impl AgentPerformer for Sleeper {
    fn initialize(&mut self, _cx: &mut TaskContext) {
        self.hooks.inits.fetch_add(1, Ordering::SeqCst);
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.hooks.invokes.fetch_add(1, Ordering::SeqCst);
        Yield::pause()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.hooks.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn shutdown_runs_exactly_once_per_unit() {
    let rt = Parallel::new(config(3)).unwrap();
    let hooks = Arc::new(Hooks::default());
    let agents: Vec<_> = (0..12)
        .map(|_| {
            rt.spawn(Sleeper {
                hooks: Arc::clone(&hooks),
            })
            .unwrap()
        })
        .collect();
    wait_until("every unit invoked once", || {
        hooks.invokes.load(Ordering::SeqCst) == 12
    });

    let snap = rt.shutdown();
    assert_eq!(hooks.inits.load(Ordering::SeqCst), 12);
    assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 12);
    assert_eq!(snap.terminated, 12);
    assert!(agents.iter().all(|a| !a.is_alive()));
}

#[test]
fn terminate_is_idempotent() {
    let rt = Parallel::new(config(1)).unwrap();
    let hooks = Arc::new(Hooks::default());
    let agent = rt
        .spawn(Sleeper {
            hooks: Arc::clone(&hooks),
        })
        .unwrap();
    wait_until("first invoke", || hooks.invokes.load(Ordering::SeqCst) == 1);

    agent.terminate();
    agent.terminate();
    agent.terminate();
    wait_until("slot torn down", || !agent.is_alive());
    agent.terminate();
    agent.notify();

    rt.shutdown();
    assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.invokes.load(Ordering::SeqCst), 1);
}

struct Ordered {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl AgentPerformer for Ordered {
    fn initialize(&mut self, _cx: &mut TaskContext) {
        self.log.lock().unwrap().push("initialize");
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.log.lock().unwrap().push("invoke");
        Yield::terminate()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.log.lock().unwrap().push("shutdown");
    }
}

#[test]
fn hooks_run_in_order_and_join_waits() {
    let rt = Parallel::new(config(2)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    rt.spawn(Ordered {
        log: Arc::clone(&log),
    })
    .unwrap();
    rt.join();
    assert_eq!(*log.lock().unwrap(), vec!["initialize", "invoke", "shutdown"]);
}

/// Runs `left` same-tick `Invoke` steps, then terminates.
struct Chain {
    left: u32,
    steps: Arc<AtomicU32>,
    done: Arc<AtomicBool>,
}

impl Chain {
    fn step(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        if self.left == 0 {
            self.done.store(true, Ordering::SeqCst);
            return Yield::terminate();
        }
        self.left -= 1;
        Yield::invoke(Chain::step)
    }
}

impl AgentPerformer for Chain {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.step(cx)
    }
}

/// Records whether it ran while the chain was still going.
struct Sibling {
    chain_done: Arc<AtomicBool>,
    ran_during_chain: Arc<AtomicBool>,
}

impl AgentPerformer for Sibling {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        if self.chain_done.load(Ordering::SeqCst) {
            return Yield::terminate();
        }
        self.ran_during_chain.store(true, Ordering::SeqCst);
        Yield::repeat()
    }
}

#[test]
fn long_invoke_chain_yields_to_siblings() {
    let rt = Parallel::new(config(1)).unwrap();
    let steps = Arc::new(AtomicU32::new(0));
    let chain_done = Arc::new(AtomicBool::new(false));
    let ran_during_chain = Arc::new(AtomicBool::new(false));

    rt.spawn(Chain {
        left: 999,
        steps: Arc::clone(&steps),
        done: Arc::clone(&chain_done),
    })
    .unwrap();
    rt.spawn(Sibling {
        chain_done: Arc::clone(&chain_done),
        ran_during_chain: Arc::clone(&ran_during_chain),
    })
    .unwrap();

    let snap = rt.join();
    assert_eq!(steps.load(Ordering::SeqCst), 1_000);
    assert!(ran_during_chain.load(Ordering::SeqCst));
    assert!(snap.budget_yields >= 10);
}

struct SelfLookup {
    found: Arc<Mutex<Option<bool>>>,
}

impl AgentPerformer for SelfLookup {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        let me = cx.runtime().get_agent(self).map(|a| a.id());
        *self.found.lock().unwrap() = Some(me == Some(cx.id()));
        Yield::terminate()
    }
}

#[test]
fn get_agent_resolves_the_calling_unit() {
    let rt = Parallel::new(config(2)).unwrap();
    let found = Arc::new(Mutex::new(None));
    rt.spawn(SelfLookup {
        found: Arc::clone(&found),
    })
    .unwrap();
    rt.join();
    assert_eq!(*found.lock().unwrap(), Some(true));
}

#[test]
fn exec_runs_on_the_owning_worker() {
    let rt = Parallel::new(config(3)).unwrap();
    let hooks = Arc::new(Hooks::default());
    let agent = rt
        .spawn_with(
            Sleeper {
                hooks: Arc::clone(&hooks),
            },
            SpawnOptions::default().on_worker(2),
        )
        .unwrap();
    let seen = Arc::new(Mutex::new(None));
    let seen_w = Arc::clone(&seen);
    assert!(agent.exec(move || {
        *seen_w.lock().unwrap() = current_worker().map(|t| t.worker);
    }));
    wait_until("exec callback", || seen.lock().unwrap().is_some());
    assert_eq!(*seen.lock().unwrap(), Some(2));
    rt.shutdown();
}

/// Waits for `go`, then spawns `children` and terminates.
struct Parent {
    go: Arc<AtomicBool>,
    children: u32,
    child_runs: Arc<AtomicU32>,
}

struct Child {
    runs: Arc<AtomicU32>,
}

impl AgentPerformer for Child {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Yield::terminate()
    }
}

impl AgentPerformer for Parent {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        if !self.go.load(Ordering::SeqCst) {
            return Yield::repeat().idle();
        }
        for _ in 0..self.children {
            cx.runtime()
                .spawn(Child {
                    runs: Arc::clone(&self.child_runs),
                })
                .unwrap();
        }
        Yield::terminate()
    }
}

#[test]
fn units_spawned_from_units_while_joining_are_joined() {
    let rt = Parallel::new(config(2)).unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    let go = Arc::new(AtomicBool::new(false));
    rt.spawn(Parent {
        go: Arc::clone(&go),
        children: 8,
        child_runs: Arc::clone(&runs),
    })
    .unwrap();

    let handle = rt.handle();
    let release = {
        let go = Arc::clone(&go);
        std::thread::spawn(move || {
            wait_until("join closed the gate", || !handle.is_accepting());
            let outside = handle.spawn(Child {
                runs: Arc::new(AtomicU32::new(0)),
            });
            assert!(matches!(outside, Err(ParallelError::ShuttingDown)));
            go.store(true, Ordering::SeqCst);
        })
    };
    let snap = rt.join();
    release.join().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 8);
    assert_eq!(snap.terminated, 9);
}

/// Tries to spawn a child from its `shutdown` hook.
struct SpawnsOnShutdown {
    result: Arc<Mutex<Option<Result<(), ParallelError>>>>,
}

impl AgentPerformer for SpawnsOnShutdown {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        Yield::pause()
    }

    fn shutdown(&mut self, cx: &mut TaskContext) {
        let r = cx
            .runtime()
            .spawn(Child {
                runs: Arc::new(AtomicU32::new(0)),
            })
            .map(|_| ());
        *self.result.lock().unwrap() = Some(r);
    }
}

#[test]
fn shutdown_refuses_child_spawns() {
    let rt = Parallel::new(config(1)).unwrap();
    let result = Arc::new(Mutex::new(None));
    rt.spawn(SpawnsOnShutdown {
        result: Arc::clone(&result),
    })
    .unwrap();
    wait_until("unit live", || rt.stats().live_tasks == 1 && !rt.tasks().is_empty());
    let snap = rt.shutdown();
    assert!(matches!(
        *result.lock().unwrap(),
        Some(Err(ParallelError::ShuttingDown))
    ));
    assert_eq!(snap.terminated, 1);
}

/// Parks a continuation with no wake time; only a notify resumes it.
struct AwaitNotify {
    armed: Arc<AtomicBool>,
    resumed: Arc<AtomicBool>,
}

impl AwaitNotify {
    fn resume(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.resumed.store(true, Ordering::SeqCst);
        Yield::terminate()
    }
}

impl AgentPerformer for AwaitNotify {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.armed.store(true, Ordering::SeqCst);
        Yield::delay_invoke(AwaitNotify::resume)
    }
}

#[test]
fn delay_without_wake_time_resumes_on_notify() {
    let rt = Parallel::new(config(1)).unwrap();
    let armed = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicBool::new(false));
    let agent = rt
        .spawn(AwaitNotify {
            armed: Arc::clone(&armed),
            resumed: Arc::clone(&resumed),
        })
        .unwrap();
    wait_until("continuation parked", || armed.load(Ordering::SeqCst));
    assert!(!resumed.load(Ordering::SeqCst));

    agent.notify();
    rt.join();
    assert!(resumed.load(Ordering::SeqCst));
}

#[test]
fn stats_report_live_slots() {
    let rt = Parallel::new(config(2)).unwrap();
    let hooks = Arc::new(Hooks::default());
    for w in 0..2 {
        rt.spawn_with(
            Sleeper {
                hooks: Arc::clone(&hooks),
            },
            SpawnOptions::named(format!("sleeper-{w}")).on_worker(w),
        )
        .unwrap();
    }
    wait_until("both paused and published", || {
        let s = rt.stats();
        s.workers.iter().all(|w| w.paused == 1)
    });
    let s = rt.stats();
    assert!(s.accepting);
    assert_eq!(s.live_tasks, 2);
    let names: Vec<_> = rt.tasks().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["sleeper-0", "sleeper-1"]);
    rt.shutdown();
}
