//! Object pools for hot-path values.
//!
//! - [`Pool<T>`]: lock-free, per-worker cached, never fails.
//! - [`PoolChecked<T>`]: tracks every lease and fails loudly on misuse.

mod checked;
mod object_pool;

pub use checked::{PoolChecked, Pooled};
pub use object_pool::{Pool, PoolConfig, PoolStats};
