//! tickrt demo CLI
//!
//! Runs a small feed -> strategy -> risk pipeline on the runtime and prints
//! the runtime metrics and queue stats as JSON on stdout.
//!
//! - `feed` publishes synthetic ticks on a `TickQueue` in bursts, delaying
//!   1ms of runtime time between bursts.
//! - `strategy` drains ticks, keeps a running VWAP, and emits a fill on a
//!   `FastFillQueue` every 100 ticks.
//! - `risk` drains fills and tracks net position.
//!
//! Under `--mode=normal` the main thread drives the clock in 1ms steps, so
//! runs are reproducible in runtime time. Under `--mode=realtime` the clock
//! follows the wall clock.
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `info`).
//!
//! # Exit Codes
//!
//! - `0`: Success
//! - `1`: Runtime failed to start
//! - `2`: Invalid arguments

use std::env;
use std::thread;
use std::time::Duration;

use tickrt::queue::{SpscReceiver, SpscSender};
use tickrt::{
    ClockMode, EnqueueError, FastFillQueue, Fill, Parallel, ParallelConfig, PerformerKind, Side,
    SpawnOptions, TaskContext, Tick, Yield,
};
use tracing_subscriber::EnvFilter;

const BURST: u64 = 100;
const FILL_EVERY: u64 = 100;

fn print_usage(exe: &str) {
    eprintln!(
        "usage: {exe} [OPTIONS]

OPTIONS:
    --workers=<N>     Number of worker threads (default: 2)
    --ticks=<N>       Ticks the feed publishes (default: 100000)
    --mode=<MODE>     normal | realtime (default: normal)
    --help, -h        Show this help message"
    );
}

struct Feed {
    queue: tickrt::TickQueue,
    tx: Option<SpscSender<Tick>>,
    sent: u64,
    total: u64,
}

impl Feed {
    fn publish(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        let Some(tx) = self.tx.as_mut() else {
            return Yield::terminate();
        };
        let burst_end = (self.sent + BURST).min(self.total);
        while self.sent < burst_end {
            let tick = Tick {
                instrument: 1,
                ts_us: cx.now_us(),
                price_ticks: 10_000 + (self.sent % 17) as i64 - 8,
                size: 1 + self.sent % 5,
            };
            match tx.try_enqueue(tick) {
                Ok(()) => self.sent += 1,
                Err(EnqueueError::Full(_)) => return Yield::repeat().idle(),
                Err(_) => return Yield::terminate(),
            }
        }
        if self.sent >= self.total {
            return Yield::terminate();
        }
        cx.delay(Duration::from_millis(1));
        Yield::delay_invoke(Feed::publish)
    }
}

impl tickrt::AgentPerformer for Feed {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.publish(cx)
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.tx = None;
        self.queue.close();
        tracing::info!(sent = self.sent, "feed done");
    }
}

struct Strategy {
    rx: SpscReceiver<Tick>,
    ticks: tickrt::TickQueue,
    fills: FastFillQueue,
    batch: Vec<Tick>,
    seen: u64,
    notional: i128,
    volume: u64,
    next_order: u64,
}

impl tickrt::AgentPerformer for Strategy {
    fn initialize(&mut self, cx: &mut TaskContext) {
        self.ticks.attach_consumer(cx.agent());
    }

    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.batch.clear();
        if self.rx.drain_into(&mut self.batch, 256) == 0 {
            if self.rx.is_finished() {
                return Yield::terminate();
            }
            return Yield::pause();
        }
        for t in &self.batch {
            self.seen += 1;
            self.notional += i128::from(t.price_ticks) * i128::from(t.size);
            self.volume += t.size;
            if self.seen % FILL_EVERY == 0 {
                self.next_order += 1;
                let vwap = (self.notional / i128::from(self.volume.max(1))) as i64;
                let side = if t.price_ticks < vwap { Side::Buy } else { Side::Sell };
                let fill = Fill {
                    order_id: self.next_order,
                    instrument: t.instrument,
                    side,
                    price_ticks: t.price_ticks,
                    qty: 1,
                    ts_us: cx.now_us(),
                };
                if let Err(e) = self.fills.enqueue(fill) {
                    tracing::warn!(order = self.next_order, error = %e, "fill dropped");
                }
            }
        }
        Yield::repeat()
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        self.fills.close();
        tracing::info!(ticks = self.seen, orders = self.next_order, "strategy done");
    }
}

struct Risk {
    fills: FastFillQueue,
    position: i64,
    count: u64,
}

impl tickrt::AgentPerformer for Risk {
    fn initialize(&mut self, cx: &mut TaskContext) {
        self.fills.attach_consumer(cx.agent());
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        let mut any = false;
        while let Some(fill) = self.fills.dequeue() {
            any = true;
            self.count += 1;
            match fill.side {
                Side::Buy => self.position += fill.qty as i64,
                Side::Sell => self.position -= fill.qty as i64,
            }
        }
        if self.fills.is_closed() && self.fills.is_empty() {
            return Yield::terminate();
        }
        Yield::pause().with_idle(!any)
    }

    fn shutdown(&mut self, _cx: &mut TaskContext) {
        tracing::info!(fills = self.count, position = self.position, "risk done");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "tickrt".into());
    let mut workers = 2usize;
    let mut ticks = 100_000u64;
    let mut mode = ClockMode::Normal;

    for flag in args {
        if let Some(value) = flag.strip_prefix("--workers=") {
            workers = match value.parse() {
                Ok(n) if n > 0 => n,
                _ => {
                    eprintln!("invalid --workers value: {value}");
                    std::process::exit(2);
                }
            };
            continue;
        }
        if let Some(value) = flag.strip_prefix("--ticks=") {
            ticks = value.parse().unwrap_or_else(|_| {
                eprintln!("invalid --ticks value: {value}");
                std::process::exit(2);
            });
            continue;
        }
        if let Some(value) = flag.strip_prefix("--mode=") {
            mode = match value {
                "normal" => ClockMode::Normal,
                "realtime" => ClockMode::RealTime,
                _ => {
                    eprintln!("invalid --mode value: {value}");
                    std::process::exit(2);
                }
            };
            continue;
        }
        match flag.as_str() {
            "--help" | "-h" => {
                print_usage(&exe);
                std::process::exit(0);
            }
            _ => {
                eprintln!("unknown argument: {flag}");
                print_usage(&exe);
                std::process::exit(2);
            }
        }
    }

    let rt = match Parallel::new(ParallelConfig {
        workers,
        mode,
        ..ParallelConfig::default()
    }) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&rt, ticks) {
        eprintln!("pipeline setup failed: {e}");
        rt.shutdown();
        std::process::exit(1);
    }

    if mode == ClockMode::Normal {
        while !rt.tasks().is_empty() {
            let _ = rt.advance_clock_by(Duration::from_millis(1));
            thread::sleep(Duration::from_micros(100));
        }
    }

    let handle = rt.handle();
    let metrics = rt.join();
    let queues = handle.queue_stats();
    let registered = handle.registered();
    let report = serde_json::json!({
        "ticks": ticks,
        "workers": workers,
        "mode": mode,
        "registered": registered,
        "metrics": metrics,
        "queues": queues,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(s) => println!("{s}"),
        Err(e) => {
            eprintln!("failed to render report: {e}");
            std::process::exit(1);
        }
    }
}

fn run(rt: &Parallel, ticks: u64) -> Result<(), Box<dyn std::error::Error>> {
    let tick_q = rt.tick_queue("es.ticks", 4096)?;
    let fill_q = rt.fill_queue("es.fills", 1024)?;
    let workers = rt.thread_count();

    let risk_fills = fill_q.clone();
    rt.register_with("risk", PerformerKind::Performer, move |_args| {
        Ok(Risk {
            fills: risk_fills.clone(),
            position: 0,
            count: 0,
        })
    })?;
    rt.spawn_named(
        "risk",
        SpawnOptions::named("risk").on_worker(workers - 1),
        serde_json::Value::Null,
    )?;

    let rx = tick_q
        .take_consumer()
        .ok_or("es.ticks consumer already claimed")?;
    rt.spawn_with(
        Strategy {
            rx,
            ticks: tick_q.clone(),
            fills: fill_q,
            batch: Vec::with_capacity(256),
            seen: 0,
            notional: 0,
            volume: 0,
            next_order: 0,
        },
        SpawnOptions::named("strategy").on_worker(workers - 1),
    )?;

    let tx = tick_q.take_producer();
    rt.spawn_with(
        Feed {
            queue: tick_q.clone(),
            tx,
            sent: 0,
            total: ticks,
        },
        SpawnOptions::named("feed").on_worker(0),
    )?;
    Ok(())
}
