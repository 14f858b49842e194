//! Runtime time: the Normal/RealTime clock and slot-bound timers.

mod clock;
pub(crate) mod timer;

pub use clock::{Clock, ClockMode};
pub use timer::{Timer, TimerAction, TimerEvent};
