//! Small, self-contained data structures used by the runtime.

pub mod spsc;
pub mod timing_wheel;

pub use spsc::{spsc_channel, SpscConsumer, SpscProducer};
pub use timing_wheel::{PushError, PushOutcome, TimingWheel};
