//! Spawning by name, closure loops, and log-level subscriptions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tickrt::{
    AgentPerformer, Looper, Parallel, ParallelError, PerformerKind, TaskContext, Yield,
};
use tracing::Level;

use crate::support::config;

static MARKET_RUNS: AtomicU32 = AtomicU32::new(0);

#[derive(serde::Deserialize)]
struct MarketFeed {
    symbol: String,
    bursts: u32,
}

impl AgentPerformer for MarketFeed {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        assert_eq!(self.symbol, "ESZ6");
        assert_eq!(cx.agent().name(), "cme-feed");
        MARKET_RUNS.fetch_add(1, Ordering::SeqCst);
        if self.bursts <= 1 {
            return Yield::terminate();
        }
        self.bursts -= 1;
        Yield::repeat()
    }
}

#[test]
fn registered_provider_spawns_from_json() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.register::<MarketFeed>("cme-feed", PerformerKind::Provider)
        .unwrap();
    let agent = rt
        .spawn_provider("cme-feed", serde_json::json!({ "symbol": "ESZ6", "bursts": 3 }))
        .unwrap();
    assert_eq!(agent.name(), "cme-feed");
    rt.join();
    assert_eq!(MARKET_RUNS.load(Ordering::SeqCst), 3);
}

#[test]
fn name_and_kind_errors() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.register::<MarketFeed>("feed", PerformerKind::Provider)
        .unwrap();

    assert!(matches!(
        rt.register::<MarketFeed>("feed", PerformerKind::Provider),
        Err(ParallelError::DuplicatePerformer(_))
    ));
    assert!(matches!(
        rt.spawn_performer("feed", serde_json::Value::Null),
        Err(ParallelError::KindMismatch {
            expected: PerformerKind::Performer,
            actual: PerformerKind::Provider,
            ..
        })
    ));
    assert!(matches!(
        rt.spawn_provider("nope", serde_json::Value::Null),
        Err(ParallelError::UnknownPerformer(_))
    ));
    assert!(matches!(
        rt.spawn_provider("feed", serde_json::json!({ "symbol": 5 })),
        Err(ParallelError::Construct { .. })
    ));
    assert!(rt.tasks().is_empty());
    rt.shutdown();
}

struct Hedger {
    hits: Arc<AtomicU32>,
}

impl AgentPerformer for Hedger {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Yield::terminate()
    }
}

#[test]
fn spawn_by_type_uses_the_registered_constructor() {
    let rt = Parallel::new(config(1)).unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    assert!(matches!(
        rt.spawn_type::<Hedger>(serde_json::Value::Null),
        Err(ParallelError::UnregisteredType(_))
    ));

    let ctor_hits = Arc::clone(&hits);
    rt.register_with("hedger", PerformerKind::Performer, move |_| {
        Ok(Hedger {
            hits: Arc::clone(&ctor_hits),
        })
    })
    .unwrap();
    let agent = rt.spawn_type::<Hedger>(serde_json::Value::Null).unwrap();
    assert_eq!(agent.name(), "hedger");
    rt.spawn_performer("hedger", serde_json::Value::Null)
        .unwrap();
    rt.join();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn run_loop_drives_a_closure_with_continuations() {
    let rt = Parallel::new(config(1)).unwrap();
    let ticks = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&ticks);
    let agent = rt
        .starter()
        .run_loop("heartbeat", None, move |_cx| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 5 {
                Yield::terminate()
            } else {
                Yield::invoke(Looper::resume)
            }
        })
        .unwrap();
    assert_eq!(agent.name(), "heartbeat");
    assert!(agent.type_name().ends_with("Looper"));
    rt.join();
    assert_eq!(ticks.load(Ordering::SeqCst), 5);
}

#[test]
fn log_level_subscribers_are_called_until_unsubscribed() {
    let rt = Parallel::new(config(1)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let levels = rt.log_levels();
    let id = levels.subscribe(move |lvl| sink.lock().unwrap().push(lvl));

    levels.set_level(Level::DEBUG);
    levels.set_level(Level::DEBUG);
    assert!(levels.unsubscribe(id));
    assert!(!levels.unsubscribe(id));
    levels.set_level(Level::WARN);

    assert_eq!(*seen.lock().unwrap(), vec![Level::DEBUG]);
    assert_eq!(levels.level(), Level::WARN);
    rt.shutdown();
}
