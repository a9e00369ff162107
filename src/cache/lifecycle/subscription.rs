//! Tracked unsubscribe callbacks with bulk disposal

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Opaque handle to a tracked subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    const INERT: SubscriptionId = SubscriptionId(0);

    /// Ids returned after disposal track nothing
    pub fn is_inert(&self) -> bool {
        *self == Self::INERT
    }
}

struct SubscriptionState {
    // Ordered so disposal unsubscribes in registration order
    callbacks: BTreeMap<SubscriptionId, Unsubscribe>,
    disposed: bool,
}

struct SubscriptionInner {
    name: String,
    state: Mutex<SubscriptionState>,
    next_id: AtomicU64,
}

/// Manager owning every subscription registered by one component
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("name", &self.inner.name)
            .field("tracked", &self.count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl SubscriptionManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                name: name.into(),
                state: Mutex::new(SubscriptionState {
                    callbacks: BTreeMap::new(),
                    disposed: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `unsubscribe`. After disposal it runs immediately instead.
    pub fn add<F>(&self, unsubscribe: F) -> SubscriptionId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.disposed {
            drop(state);
            log::warn!(
                "SubscriptionManager '{}' is disposed; unsubscribing immediately",
                self.inner.name
            );
            self.invoke(Box::new(unsubscribe));
            return SubscriptionId::INERT;
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        state.callbacks.insert(id, Box::new(unsubscribe));
        id
    }

    /// Unsubscribe one tracked callback. Returns whether it was still tracked.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let callback = self.lock().callbacks.remove(&id);
        match callback {
            Some(callback) => {
                self.invoke(callback);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a callback without invoking it
    pub fn forget(&self, id: SubscriptionId) -> bool {
        self.lock().callbacks.remove(&id).is_some()
    }

    pub fn count(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Invoke every tracked callback exactly once and reject further
    /// additions. Safe to call repeatedly.
    pub fn dispose(&self) {
        let callbacks = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.callbacks)
        };

        log::debug!(
            "SubscriptionManager '{}' disposing {} subscriptions",
            self.inner.name,
            callbacks.len()
        );
        for (_, callback) in callbacks {
            self.invoke(callback);
        }
    }

    // A panicking unsubscribe must not prevent the others from running
    fn invoke(&self, callback: Unsubscribe) {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            log::error!(
                "SubscriptionManager '{}': unsubscribe callback panicked",
                self.inner.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispose_invokes_each_once() {
        let subs = SubscriptionManager::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        subs.add(counting(&calls));
        subs.add(counting(&calls));
        assert_eq!(subs.count(), 2);

        subs.dispose();
        subs.dispose();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(subs.count(), 0);
        assert!(subs.is_disposed());
    }

    #[test]
    fn test_add_after_dispose_unsubscribes_immediately() {
        let subs = SubscriptionManager::new("test");
        subs.dispose();

        let calls = Arc::new(AtomicUsize::new(0));
        let id = subs.add(counting(&calls));

        assert!(id.is_inert());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(subs.count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let subs = SubscriptionManager::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let id = subs.add(counting(&calls));

        assert!(subs.remove(id));
        assert!(!subs.remove(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subs.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forget_skips_callback() {
        let subs = SubscriptionManager::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let id = subs.add(counting(&calls));

        assert!(subs.forget(id));
        subs.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_unsubscribe_does_not_block_others() {
        let subs = SubscriptionManager::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        subs.add(|| panic!("unsubscribe failure"));
        subs.add(counting(&calls));

        subs.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
