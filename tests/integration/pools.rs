//! Named pools used from units on several workers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tickrt::{AgentPerformer, Parallel, Pool, PoolError, SpawnOptions, TaskContext, Yield};

use crate::support::config;

/// Acquires and releases a buffer `rounds` times from its worker.
struct Churn {
    pool: Pool<Vec<u8>>,
    rounds: u32,
    dirty: Arc<AtomicU32>,
}

impl AgentPerformer for Churn {
    fn invoke(&mut self, _cx: &mut TaskContext) -> Yield<Self> {
        if self.rounds == 0 {
            return Yield::terminate();
        }
        self.rounds -= 1;
        let mut buf = self.pool.acquire();
        if !buf.is_empty() {
            self.dirty.fetch_add(1, Ordering::SeqCst);
        }
        buf.extend_from_slice(b"quote");
        self.pool.release(buf);
        Yield::repeat()
    }
}

#[test]
fn worker_local_reuse_keeps_allocation_flat() {
    let rt = Parallel::new(config(2)).unwrap();
    let pool = rt
        .pool("scratch", || Vec::<u8>::with_capacity(64))
        .unwrap();
    let dirty = Arc::new(AtomicU32::new(0));
    for w in 0..2 {
        let pool = rt.pool("scratch", Vec::<u8>::new).unwrap();
        rt.spawn_with(
            Churn {
                pool,
                rounds: 500,
                dirty: Arc::clone(&dirty),
            },
            SpawnOptions::default().on_worker(w),
        )
        .unwrap();
    }
    rt.join();
    let s = pool.stats();
    assert_eq!(s.acquired, 1_000);
    assert_eq!(s.released, 1_000);
    assert!(s.created <= 2, "created {}", s.created);
    // No reset hook: values come back as they were released.
    assert!(dirty.load(Ordering::SeqCst) > 0);
}

#[test]
fn checked_pool_reports_misuse() {
    let rt = Parallel::new(config(1)).unwrap();
    let pool = rt.checked_pool("orders", || [0u64; 8]).unwrap();
    let other = rt.checked_pool("other", || [0u64; 8]).unwrap();

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_ne!(a.slot(), b.slot());
    assert_eq!(pool.outstanding(), 2);

    let a_again = a.clone();
    pool.release(a).unwrap();
    assert!(matches!(
        pool.release(a_again),
        Err(PoolError::NotLeased { slot: 0, .. })
    ));

    let foreign = other.acquire().unwrap();
    assert!(matches!(
        pool.release(foreign),
        Err(PoolError::ForeignInstance { .. })
    ));

    assert_eq!(pool.dispose(), 1);
    assert!(matches!(pool.acquire(), Err(PoolError::Disposed { .. })));
    pool.release(b).unwrap();
    assert_eq!(pool.outstanding(), 0);
    rt.shutdown();
}
