//! Keyed throttle: leading edge plus at most one trailing call per window

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::cache::lifecycle::{TimerHandle, TimerManager};
use crate::cache::traits::CacheKey;

type Deferred = Box<dyn FnOnce() + Send>;

struct Window {
    trailing: Option<Deferred>,
    handle: TimerHandle,
}

struct ThrottleInner<K> {
    window: Duration,
    timers: TimerManager,
    windows: Mutex<HashMap<K, Window>>,
}

/// What happened to a throttled call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// Ran immediately and opened a window
    Immediate,
    /// Stored as the trailing call of the open window, replacing any earlier one
    Deferred,
}

/// Throttle keyed calls on a shared `TimerManager`
pub struct Throttler<K> {
    inner: Arc<ThrottleInner<K>>,
}

impl<K> Clone for Throttler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey> ThrottleInner<K> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_window(self: &Arc<Self>, key: K, windows: &mut HashMap<K, Window>) -> bool {
        let weak = Arc::downgrade(self);
        let owned_key = key.clone();
        let handle = self
            .timers
            .set_timeout(self.window, move || Self::close_window(&weak, owned_key));
        if handle.is_inert() {
            return false;
        }
        windows.insert(
            key,
            Window {
                trailing: None,
                handle,
            },
        );
        true
    }

    fn close_window(weak: &Weak<Self>, key: K) {
        let Some(inner) = weak.upgrade() else { return };
        let trailing = {
            let mut windows = inner.lock();
            let trailing = windows.remove(&key).and_then(|window| window.trailing);
            // A trailing call starts the next window
            if trailing.is_some() {
                inner.open_window(key, &mut windows);
            }
            trailing
        };
        if let Some(callback) = trailing {
            callback();
        }
    }
}

impl<K: CacheKey> Throttler<K> {
    pub fn new(window: Duration, timers: TimerManager) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                window,
                timers,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run `callback` now if no window is open for `key`, otherwise keep it
    /// as the window's trailing call
    pub fn call<F>(&self, key: K, callback: F) -> ThrottleOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut windows = self.inner.lock();
            if let Some(window) = windows.get_mut(&key) {
                window.trailing = Some(Box::new(callback));
                return ThrottleOutcome::Deferred;
            }
            if !self.inner.open_window(key, &mut windows) {
                log::debug!("Throttle window not scheduled; running call unthrottled");
            }
        }
        callback();
        ThrottleOutcome::Immediate
    }

    pub fn is_throttled(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Close every window, discarding trailing calls
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Window> = self.inner.lock().drain().map(|(_, window)| window).collect();
        for window in &drained {
            self.inner.timers.clear(window.handle);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> impl FnOnce() + Send + 'static {
        let log = log.clone();
        move || log.lock().unwrap().push(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_and_single_trailing_call() {
        let throttler = Throttler::new(Duration::from_millis(100), TimerManager::new("test"));
        let log = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(throttler.call("k", recorder(&log, 1)), ThrottleOutcome::Immediate);
        assert_eq!(throttler.call("k", recorder(&log, 2)), ThrottleOutcome::Deferred);
        assert_eq!(throttler.call("k", recorder(&log, 3)), ThrottleOutcome::Deferred);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
        assert!(throttler.is_throttled(&"k"));

        // The trailing call opened a window with nothing queued behind it
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert!(!throttler.is_throttled(&"k"));
        assert_eq!(throttler.call("k", recorder(&log, 4)), ThrottleOutcome::Immediate);
        assert_eq!(*log.lock().unwrap(), vec![1, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_discards_trailing() {
        let throttler = Throttler::new(Duration::from_millis(10), TimerManager::new("test"));
        let log = Arc::new(Mutex::new(Vec::new()));
        throttler.call("a", recorder(&log, 1));
        throttler.call("a", recorder(&log, 2));

        assert_eq!(throttler.cancel_all(), 1);
        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }
}
