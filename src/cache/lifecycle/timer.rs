//! Tracked one-shot and interval timers with bulk cancellation
//!
//! Every timer is a tokio task registered in the manager's tracking set.
//! One-shot timers remove themselves once their callback finishes, whether it
//! returned normally or panicked, so long-lived managers do not accumulate
//! dead handles. After `dispose()` every request yields an inert handle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::traits::TimerKind;

/// Opaque handle to a tracked timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
    kind: TimerKind,
}

impl TimerHandle {
    const INERT_ID: u64 = 0;

    fn inert(kind: TimerKind) -> Self {
        Self {
            id: Self::INERT_ID,
            kind,
        }
    }

    /// Handles returned after disposal (or without a runtime) track nothing
    pub fn is_inert(&self) -> bool {
        self.id == Self::INERT_ID
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

#[derive(Debug)]
struct TrackedTimer {
    kind: TimerKind,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct TimerState {
    timers: HashMap<u64, TrackedTimer>,
    disposed: bool,
}

#[derive(Debug)]
struct TimerInner {
    name: String,
    state: Mutex<TimerState>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl TimerInner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        // Backstop only: owners are expected to call dispose()
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in state.timers.drain() {
            timer.task.abort();
        }
    }
}

/// Removes a one-shot entry from the tracking set when its task finishes or
/// unwinds.
struct Untrack {
    inner: Weak<TimerInner>,
    id: u64,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().timers.remove(&self.id);
        }
    }
}

/// Manager owning every timer created by one component
#[derive(Debug, Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

impl TimerManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                name: name.into(),
                state: Mutex::new(TimerState {
                    timers: HashMap::new(),
                    disposed: false,
                }),
                next_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `callback` once after `delay`
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_timeout(delay, async move { callback() })
    }

    /// Await `future` once after `delay`; the handle stays tracked until the
    /// future completes
    pub fn spawn_timeout<Fut>(&self, delay: Duration, future: Fut) -> TimerHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        self.track(TimerKind::Timeout, move |guard| async move {
            let _guard = guard;
            tokio::time::sleep_until(deadline).await;
            future.await;
        })
    }

    /// Track an arbitrary future; it is aborted by `clear` or `dispose`
    pub fn spawn_task<Fut>(&self, future: Fut) -> TimerHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.track(TimerKind::Task, move |guard| async move {
            let _guard = guard;
            future.await;
        })
    }

    /// Run `callback` every `period`, first firing one period from now
    pub fn set_interval<F>(&self, period: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            log::warn!(
                "TimerManager '{}': zero interval period rejected",
                self.inner.name
            );
            return TimerHandle::inert(TimerKind::Interval);
        }

        let start = Instant::now() + period;
        self.track(TimerKind::Interval, move |guard| async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                callback();
            }
        })
    }

    fn track<B, Fut>(&self, kind: TimerKind, build: B) -> TimerHandle
    where
        B: FnOnce(Untrack) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            log::warn!(
                "TimerManager '{}' is disposed; returning inert {:?} handle",
                self.inner.name,
                kind
            );
            return TimerHandle::inert(kind);
        }

        let Ok(runtime) = Handle::try_current() else {
            log::warn!(
                "TimerManager '{}': no tokio runtime, {:?} timer not scheduled",
                self.inner.name,
                kind
            );
            return TimerHandle::inert(kind);
        };

        // Hold the lock across spawn so a timer that finishes immediately
        // cannot untrack itself before it is inserted.
        let mut state = self.inner.lock();
        if state.disposed {
            return TimerHandle::inert(kind);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Untrack {
            inner: Arc::downgrade(&self.inner),
            id,
        };
        let task = runtime.spawn(build(guard));
        state.timers.insert(id, TrackedTimer { kind, task });

        TimerHandle { id, kind }
    }

    /// Cancel a one-shot timer; returns whether it was still tracked
    pub fn clear_timeout(&self, handle: TimerHandle) -> bool {
        self.clear(handle)
    }

    /// Cancel an interval; returns whether it was still tracked
    pub fn clear_interval(&self, handle: TimerHandle) -> bool {
        self.clear(handle)
    }

    /// Cancel any tracked timer. Idempotent.
    pub fn clear(&self, handle: TimerHandle) -> bool {
        if handle.is_inert() {
            return false;
        }
        let removed = self.inner.lock().timers.remove(&handle.id);
        match removed {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked timer but keep accepting new ones
    pub fn clear_all(&self) -> usize {
        let drained: Vec<TrackedTimer> = {
            let mut state = self.inner.lock();
            state.timers.drain().map(|(_, timer)| timer).collect()
        };
        let count = drained.len();
        for timer in drained {
            timer.task.abort();
        }
        count
    }

    pub fn is_tracked(&self, handle: TimerHandle) -> bool {
        !handle.is_inert() && self.inner.lock().timers.contains_key(&handle.id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Number of tracked timers of one kind
    pub fn count_of(&self, kind: TimerKind) -> usize {
        self.inner
            .lock()
            .timers
            .values()
            .filter(|timer| timer.kind == kind)
            .count()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Cancel every timer and refuse new ones. Safe to call repeatedly.
    pub fn dispose(&self) {
        let drained: Vec<TrackedTimer> = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.inner.disposed.store(true, Ordering::Release);
            state.timers.drain().map(|(_, timer)| timer).collect()
        };

        log::debug!(
            "TimerManager '{}' disposed, cancelled {} timers",
            self.inner.name,
            drained.len()
        );
        for timer in drained {
            timer.task.abort();
        }
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
    async fn test_timeout_fires_once_and_untracks() {
        let timers = TimerManager::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let handle = timers.set_timeout(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_tracked(handle));

        tokio::time::advance(Duration::from_millis(11)).await;
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
        assert!(!timers.clear_timeout(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_timeout_still_untracks() {
        let timers = TimerManager::new("test");
        timers.set_timeout(Duration::from_millis(5), || panic!("callback failure"));

        tokio::time::advance(Duration::from_millis(6)).await;
        settle().await;

        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_timeout_is_idempotent() {
        let timers = TimerManager::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = timers.set_timeout(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.clear_timeout(handle));
        assert!(!timers.clear_timeout(handle));

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_repeats_until_cleared() {
        let timers = TimerManager::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = timers.set_interval(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(10)).await;
            settle().await;
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(timers.count_of(TimerKind::Interval), 1);

        assert!(timers.clear_interval(handle));
        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_and_degrades() {
        let timers = TimerManager::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            timers.set_timeout(Duration::from_millis(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.active_count(), 3);

        timers.dispose();
        timers.dispose();
        assert!(timers.is_disposed());
        assert_eq!(timers.active_count(), 0);

        let counter = fired.clone();
        let late = timers.set_timeout(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(late.is_inert());
        assert!(!timers.clear(late));

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_without_runtime_returns_inert_handle() {
        let timers = TimerManager::new("no-runtime");
        let handle = timers.set_interval(Duration::from_millis(10), || {});
        assert!(handle.is_inert());
        assert_eq!(timers.active_count(), 0);
    }
}
