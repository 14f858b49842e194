//! Integration tests for the tickrt runtime.
//!
//! Run with: `cargo test --test integration`

mod backoff;
mod faults;
mod lifecycle;
mod pools;
mod queues;
mod registry;
mod support;
mod timers;
