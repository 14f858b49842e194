//! Explicit log-level subscriptions.
//!
//! Components that cache a verbosity decision (a provider that skips
//! formatting debug payloads, say) subscribe here and are called back when
//! the runtime level changes. There is no weak-reference magic: a subscriber
//! stays registered until it calls [`LevelSubscribers::unsubscribe`],
//! typically from its own `shutdown`.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;

/// Token returned by [`LevelSubscribers::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type LevelCallback = Arc<dyn Fn(Level) + Send + Sync + 'static>;

struct Inner {
    level: Level,
    next_id: u64,
    subscribers: Vec<(SubscriptionId, LevelCallback)>,
}

/// Observer list for the runtime log level.
pub struct LevelSubscribers {
    inner: Mutex<Inner>,
}

impl LevelSubscribers {
    pub fn new(level: Level) -> Self {
        Self {
            inner: Mutex::new(Inner {
                level,
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register `callback`. It is not called for the current level; read
    /// [`Self::level`] for that.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Level) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    /// Change the level and notify every subscriber.
    ///
    /// Callbacks run on the calling thread, outside the internal lock, so a
    /// callback may itself subscribe or unsubscribe.
    pub fn set_level(&self, level: Level) {
        let callbacks: Vec<LevelCallback> = {
            let mut inner = self.lock();
            if inner.level == level {
                return;
            }
            inner.level = level;
            inner.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        tracing::info!(%level, subscribers = callbacks.len(), "log level changed");
        for cb in callbacks {
            cb(level);
        }
    }

    pub fn level(&self) -> Level {
        self.lock().level
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LevelSubscribers {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl std::fmt::Debug for LevelSubscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("LevelSubscribers")
            .field("level", &inner.level)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}
