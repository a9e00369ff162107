//! Keyed trailing-edge debounce
//!
//! Each call for a key replaces the pending one and restarts its delay, so
//! only the last call in a quiet period runs.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cache::lifecycle::{TimerHandle, TimerManager};
use crate::cache::traits::CacheKey;

#[derive(Debug, Clone, Copy)]
struct Pending {
    generation: u64,
    handle: TimerHandle,
}

struct DebounceInner<K> {
    delay: Duration,
    timers: TimerManager,
    pending: Mutex<HashMap<K, Pending>>,
    generation: AtomicU64,
}

impl<K: Eq + Hash> DebounceInner<K> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Debounce keyed calls on a shared `TimerManager`
pub struct Debouncer<K> {
    inner: Arc<DebounceInner<K>>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey> Debouncer<K> {
    pub fn new(delay: Duration, timers: TimerManager) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                delay,
                timers,
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Run `callback` after the delay unless `key` is called again first
    pub fn call<F>(&self, key: K, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_async(key, async move { callback() })
    }

    /// Debounced future; it is awaited once the delay passes quietly
    pub fn call_async<Fut>(&self, key: K, future: Fut) -> TimerHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.clone();

        let mut pending = self.inner.lock();
        let handle = self.inner.timers.spawn_timeout(self.inner.delay, async move {
            if let Some(inner) = weak.upgrade() {
                let mut pending = inner.lock();
                if pending
                    .get(&owned_key)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    pending.remove(&owned_key);
                }
            }
            future.await;
        });

        let replaced = if handle.is_inert() {
            pending.remove(&key)
        } else {
            pending.insert(key, Pending { generation, handle })
        };
        drop(pending);

        if let Some(previous) = replaced {
            self.inner.timers.clear(previous.handle);
        }
        handle
    }

    /// Drop the pending call for `key`; returns whether one was pending
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.inner.lock().remove(key);
        match removed {
            Some(entry) => self.inner.timers.clear(entry.handle),
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop every pending call. The shared `TimerManager` is left running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = self.inner.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            self.inner.timers.clear(entry.handle);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_call_wins() {
        let debouncer = Debouncer::new(Duration::from_millis(100), TimerManager::new("test"));
        let last = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        for value in 1..=3 {
            let last = last.clone();
            let runs = runs.clone();
            debouncer.call("save", move || {
                last.store(value, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
        assert!(!debouncer.is_pending(&"save"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent_and_cancellable() {
        let timers = TimerManager::new("test");
        let debouncer = Debouncer::new(Duration::from_millis(10), timers.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let runs = runs.clone();
            debouncer.call(key, move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(debouncer.pending_count(), 2);

        assert!(debouncer.cancel(&"a"));
        assert!(!debouncer.cancel(&"a"));

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
    }
}
