//! Queues between units: FIFO delivery across workers, overflow policy, and
//! edge-triggered consumer wakes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tickrt::queue::SpscReceiver;
use tickrt::{
    AgentPerformer, EnqueueError, Event, EventQueue, FastQueue, OverflowPolicy, Parallel,
    SpawnOptions, TaskContext, Tick, Yield,
};

use crate::support::{config, wait_until};

/// Sends `batches` on the named event queue, one batch per invocation.
struct Publisher {
    batches: Vec<Vec<u64>>,
    next: usize,
}

impl AgentPerformer for Publisher {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        let q = cx.runtime().event_queue("md.events", 64).unwrap();
        let Some(batch) = self.batches.get(self.next) else {
            return Yield::terminate();
        };
        for &seq in batch {
            q.enqueue(Event::new(7, seq).at(cx.now_us())).unwrap();
        }
        self.next += 1;
        Yield::repeat()
    }
}

/// Drains the named event queue until it has seen `expect` events.
struct Collector {
    queue: Option<EventQueue>,
    expect: usize,
    seen: Arc<Mutex<Vec<u64>>>,
    invokes: Arc<AtomicU32>,
}

impl AgentPerformer for Collector {
    fn initialize(&mut self, cx: &mut TaskContext) {
        let q = cx.runtime().event_queue("md.events", 64).unwrap();
        assert!(q.attach_consumer(cx.agent()));
        self.queue = Some(q);
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        let Some(q) = self.queue.as_ref() else {
            return Yield::terminate();
        };
        let mut seen = self.seen.lock().unwrap();
        while let Some(ev) = q.dequeue() {
            seen.push(ev.seq);
        }
        if seen.len() >= self.expect {
            return Yield::terminate();
        }
        Yield::pause()
    }
}

#[test]
fn named_event_queue_delivers_in_order_across_workers() {
    let rt = Parallel::new(config(2)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let invokes = Arc::new(AtomicU32::new(0));
    rt.spawn_with(
        Collector {
            queue: None,
            expect: 4,
            seen: Arc::clone(&seen),
            invokes: Arc::clone(&invokes),
        },
        SpawnOptions::named("collector").on_worker(1),
    )
    .unwrap();
    wait_until("collector paused", || invokes.load(Ordering::SeqCst) >= 1);

    rt.spawn_with(
        Publisher {
            batches: vec![vec![1, 2, 3], vec![4]],
            next: 0,
        },
        SpawnOptions::named("publisher").on_worker(0),
    )
    .unwrap();

    let handle = rt.handle();
    rt.join();
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    let stats = handle.queue_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "md.events");
    assert_eq!(stats[0].kind, "EventQueue");
    assert_eq!((stats[0].enqueued, stats[0].dequeued), (4, 4));
}

#[test]
fn paused_consumer_is_not_invoked_until_an_enqueue() {
    let rt = Parallel::new(config(1)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let invokes = Arc::new(AtomicU32::new(0));
    rt.spawn(Collector {
        queue: None,
        expect: 1,
        seen: Arc::clone(&seen),
        invokes: Arc::clone(&invokes),
    })
    .unwrap();
    wait_until("collector paused", || invokes.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(invokes.load(Ordering::SeqCst), 1);

    let q = rt.event_queue("md.events", 64).unwrap();
    q.enqueue(Event::new(1, 42)).unwrap();
    rt.join();
    assert_eq!(*seen.lock().unwrap(), vec![42]);
    assert_eq!(invokes.load(Ordering::SeqCst), 2);
}

#[test]
fn fill_queue_rejects_when_full() {
    let rt = Parallel::new(config(1)).unwrap();
    let q = rt.fill_queue("fills", 2).unwrap();
    let fill = |id| tickrt::Fill {
        order_id: id,
        instrument: 3,
        side: tickrt::Side::Buy,
        price_ticks: 101,
        qty: 5,
        ts_us: 0,
    };
    q.enqueue(fill(1)).unwrap();
    q.enqueue(fill(2)).unwrap();
    let err = q.enqueue(fill(3)).unwrap_err();
    assert!(err.is_full());
    assert_eq!(err.into_inner().order_id, 3);
    assert_eq!(q.dequeue().map(|f| f.order_id), Some(1));
    assert_eq!(q.dequeue().map(|f| f.order_id), Some(2));
    assert_eq!(q.stats().rejected, 1);
    rt.shutdown();
}

/// Drains a generic queue slowly: one item per invocation.
struct SlowDrain {
    queue: FastQueue<u32>,
    got: Arc<Mutex<Vec<u32>>>,
    expect: usize,
}

impl AgentPerformer for SlowDrain {
    fn initialize(&mut self, cx: &mut TaskContext) {
        self.queue.attach_consumer(cx.agent());
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        let mut got = self.got.lock().unwrap();
        match self.queue.dequeue() {
            Some(v) => got.push(v),
            None => return Yield::pause(),
        }
        if got.len() == self.expect {
            Yield::terminate()
        } else {
            Yield::repeat()
        }
    }
}

#[test]
fn block_policy_makes_external_producers_wait() {
    let rt = Parallel::new(config(1)).unwrap();
    let q = rt.queue::<u32>("slow", 1, OverflowPolicy::Block).unwrap();
    let got = Arc::new(Mutex::new(Vec::new()));
    rt.spawn(SlowDrain {
        queue: q.clone(),
        got: Arc::clone(&got),
        expect: 100,
    })
    .unwrap();

    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for i in 0..100 {
                q.enqueue(i).unwrap();
            }
        })
    };
    producer.join().unwrap();
    rt.join();
    assert_eq!(*got.lock().unwrap(), (0..100).collect::<Vec<_>>());
    assert!(q.stats().high_water <= 1);
}

#[test]
fn closed_queue_hands_values_back() {
    let rt = Parallel::new(config(1)).unwrap();
    let q = rt.queue::<&'static str>("c", 4, OverflowPolicy::Block).unwrap();
    q.close();
    assert!(matches!(q.enqueue("late"), Err(EnqueueError::Closed("late"))));
    assert!(matches!(
        q.enqueue_timeout("late", Duration::from_millis(1)),
        Err(EnqueueError::Closed("late"))
    ));
    rt.shutdown();
}

struct TickSink {
    rx: SpscReceiver<Tick>,
    total: Arc<AtomicU32>,
}

impl AgentPerformer for TickSink {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        let mut got = 0;
        while let Some(t) = self.rx.dequeue() {
            assert_eq!(u64::from(self.total.load(Ordering::SeqCst)), t.ts_us);
            self.total.fetch_add(1, Ordering::SeqCst);
            got += 1;
        }
        if self.rx.is_finished() {
            return Yield::terminate();
        }
        Yield::pause().with_idle(got == 0)
    }
}

#[test]
fn tick_queue_streams_from_a_feed_thread() {
    let rt = Parallel::new(config(2)).unwrap();
    let q = rt.tick_queue("es", 16).unwrap();
    let rx = q.take_consumer().unwrap();
    let total = Arc::new(AtomicU32::new(0));
    let agent = rt
        .spawn(TickSink {
            rx,
            total: Arc::clone(&total),
        })
        .unwrap();
    assert!(q.attach_consumer(&agent));
    assert!(q.take_consumer().is_none());

    let mut tx = q.take_producer().unwrap();
    for i in 0..5_000u64 {
        tx.enqueue(Tick {
            instrument: 9,
            ts_us: i,
            price_ticks: 4_200,
            size: 1,
        })
        .unwrap();
    }
    q.close();
    rt.join();
    assert_eq!(total.load(Ordering::SeqCst), 5_000);
    let s = q.stats();
    assert_eq!(s.kind, "TickQueue");
    assert_eq!((s.enqueued, s.dequeued), (5_000, 5_000));
    assert!(s.closed);
}
