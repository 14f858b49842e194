//! Deadlines and timers against both clock regimes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tickrt::{AgentPerformer, ClockMode, Parallel, TaskContext, Timer, TimerEvent, Yield};

use crate::support::{config, realtime, wait_until};

/// Delays 50ms of runtime time once, then records when it resumed.
struct Sleeper50 {
    armed_at: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
    resumed_at: Arc<AtomicU64>,
    wall_start: Option<Instant>,
    wall_elapsed: Arc<Mutex<Option<Duration>>>,
}

impl Sleeper50 {
    fn new() -> Self {
        Self {
            armed_at: Arc::new(AtomicU64::new(0)),
            armed: Arc::new(AtomicBool::new(false)),
            resumed_at: Arc::new(AtomicU64::new(u64::MAX)),
            wall_start: None,
            wall_elapsed: Arc::new(Mutex::new(None)),
        }
    }

    fn observers(&self) -> (Arc<AtomicU64>, Arc<AtomicBool>, Arc<AtomicU64>, Arc<Mutex<Option<Duration>>>) {
        (
            Arc::clone(&self.armed_at),
            Arc::clone(&self.armed),
            Arc::clone(&self.resumed_at),
            Arc::clone(&self.wall_elapsed),
        )
    }

    fn wake(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.resumed_at.store(cx.now_us(), Ordering::SeqCst);
        *self.wall_elapsed.lock().unwrap() = self.wall_start.map(|s| s.elapsed());
        Yield::terminate()
    }
}

impl AgentPerformer for Sleeper50 {
    fn invoke(&mut self, cx: &mut TaskContext) -> Yield<Self> {
        self.armed_at.store(cx.now_us(), Ordering::SeqCst);
        self.wall_start = Some(Instant::now());
        cx.delay(Duration::from_millis(50));
        self.armed.store(true, Ordering::SeqCst);
        Yield::delay_invoke(Sleeper50::wake)
    }
}

#[test]
fn delay_fires_exactly_at_deadline_under_normal_clock() {
    let rt = Parallel::new(config(1)).unwrap();
    let unit = Sleeper50::new();
    let (armed_at, armed, resumed_at, _) = unit.observers();
    rt.spawn(unit).unwrap();
    wait_until("delay armed", || armed.load(Ordering::SeqCst));
    assert_eq!(armed_at.load(Ordering::SeqCst), 0);

    rt.advance_clock_to(49_999).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(resumed_at.load(Ordering::SeqCst), u64::MAX, "fired early");

    rt.advance_clock_to(50_000).unwrap();
    rt.join();
    assert_eq!(resumed_at.load(Ordering::SeqCst), 50_000);
}

#[test]
fn delay_is_never_early_under_realtime_clock() {
    let rt = Parallel::new(realtime(1)).unwrap();
    let unit = Sleeper50::new();
    let (armed_at, _, resumed_at, wall) = unit.observers();
    rt.spawn(unit).unwrap();
    rt.join();

    let start = armed_at.load(Ordering::SeqCst);
    let end = resumed_at.load(Ordering::SeqCst);
    assert!(end >= start + 50_000, "resumed at {end}, armed at {start}");
    let wall = wall.lock().unwrap().expect("resumed");
    assert!(wall >= Duration::from_millis(50), "wall elapsed {wall:?}");
}

/// Starts a timer in `initialize`, pauses, and terminates once woken by it.
struct TimerUser {
    at_us: u64,
    timer: Option<Timer>,
    events: Arc<Mutex<Vec<TimerEvent>>>,
    cancel_immediately: bool,
    invokes: Arc<AtomicU32>,
}

impl AgentPerformer for TimerUser {
    fn initialize(&mut self, cx: &mut TaskContext) {
        let sink = Arc::clone(&self.events);
        let timer = cx.create_timer_with("quote-refresh", move |ev| {
            sink.lock().unwrap().push(ev.clone());
        });
        assert!(timer.start(self.at_us));
        assert!(!timer.start(self.at_us + 1), "second start on an active timer");
        if self.cancel_immediately {
            assert!(timer.cancel());
        }
        self.timer = Some(timer);
    }

    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        let n = self.invokes.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            return Yield::pause();
        }
        Yield::terminate()
    }
}

fn timer_user(at_us: u64, cancel_immediately: bool) -> (TimerUser, Arc<Mutex<Vec<TimerEvent>>>, Arc<AtomicU32>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let invokes = Arc::new(AtomicU32::new(0));
    (
        TimerUser {
            at_us,
            timer: None,
            events: Arc::clone(&events),
            cancel_immediately,
            invokes: Arc::clone(&invokes),
        },
        events,
        invokes,
    )
}

#[test]
fn timer_runs_action_then_wakes_slot() {
    let rt = Parallel::new(config(1)).unwrap();
    let (unit, events, invokes) = timer_user(10_000, false);
    let agent = rt.spawn(unit).unwrap();
    wait_until("paused", || invokes.load(Ordering::SeqCst) == 1);

    rt.advance_clock_to(9_999).unwrap();
    thread::sleep(Duration::from_millis(10));
    assert!(events.lock().unwrap().is_empty());

    rt.advance_clock_to(10_000).unwrap();
    rt.join();
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(&*events[0].name, "quote-refresh");
    assert_eq!(events[0].task, agent.id());
    assert_eq!(events[0].scheduled_us, 10_000);
    assert_eq!(events[0].fired_us, 10_000);
    assert_eq!(invokes.load(Ordering::SeqCst), 2);
}

#[test]
fn cancelled_timer_never_fires() {
    let rt = Parallel::new(config(1)).unwrap();
    let (unit, events, invokes) = timer_user(1_000, true);
    rt.spawn(unit).unwrap();
    wait_until("paused", || invokes.load(Ordering::SeqCst) == 1);
    rt.advance_clock_to(5_000).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(invokes.load(Ordering::SeqCst), 1);
    rt.shutdown();
}

#[test]
fn far_deadlines_beyond_the_wheel_horizon_still_fire() {
    let rt = Parallel::new(config(1)).unwrap();
    let (unit, events, invokes) = timer_user(5_000_000, false);
    rt.spawn(unit).unwrap();
    wait_until("paused", || invokes.load(Ordering::SeqCst) == 1);
    rt.advance_clock_by(Duration::from_secs(4)).unwrap();
    thread::sleep(Duration::from_millis(10));
    assert!(events.lock().unwrap().is_empty());
    rt.advance_clock_by(Duration::from_secs(1)).unwrap();
    rt.join();
    assert_eq!(events.lock().unwrap()[0].fired_us, 5_000_000);
}

#[test]
fn clock_mode_switch_keeps_time_monotone() {
    let rt = Parallel::new(config(1)).unwrap();
    rt.advance_clock_to(1_000_000).unwrap();
    assert_eq!(rt.set_mode(ClockMode::RealTime), ClockMode::Normal);
    let a = rt.micro_count();
    assert!(a >= 1_000_000);
    thread::sleep(Duration::from_millis(2));
    let b = rt.micro_count();
    assert!(b > a);
    assert_eq!(rt.set_mode(ClockMode::Normal), ClockMode::RealTime);
    assert!(rt.micro_count() >= b);
    rt.shutdown();
}
