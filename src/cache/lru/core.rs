//! Fixed-capacity, TTL-aware LRU cache
//!
//! Expiry is checked lazily on every access; a low-frequency interval sweep
//! reclaims entries that are never read again. Overwrites are
//! last-writer-wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;

use super::entry::{CacheEntry, RecencyList};
use super::statistics::{LruCounters, LruStats};
use crate::cache::config::LruConfig;
use crate::cache::lifecycle::{TimerHandle, TimerManager};
use crate::cache::traits::{CacheKey, CacheValue, LifecycleResult};

#[derive(Debug)]
struct LruStore<K, V> {
    entries: RecencyList<K, V>,
    capacity: usize,
    default_ttl: Option<Duration>,
}

impl<K: CacheKey, V> LruStore<K, V> {
    /// Slot of a live entry; an expired entry is removed on the way
    fn live_slot(&mut self, key: &K, now: Instant, counters: &LruCounters) -> Option<usize> {
        let slot = self.entries.slot_of(key)?;
        let expired = self
            .entries
            .entry(slot)
            .is_some_and(|entry| entry.is_expired(now));
        if expired {
            self.entries.remove(slot);
            counters.record_expirations(1);
            return None;
        }
        Some(slot)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<usize> = self
            .entries
            .slots_lru_first()
            .into_iter()
            .filter(|slot| {
                self.entries
                    .entry(*slot)
                    .is_some_and(|entry| entry.is_expired(now))
            })
            .collect();
        for slot in &expired {
            self.entries.remove(*slot);
        }
        expired.len()
    }
}

struct LruInner<K, V> {
    store: Mutex<LruStore<K, V>>,
    counters: LruCounters,
    timers: TimerManager,
    sweep: Mutex<Option<TimerHandle>>,
    disposed: AtomicBool,
}

impl<K, V> LruInner<K, V> {
    fn lock(&self) -> MutexGuard<'_, LruStore<K, V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// LRU cache with optional per-entry TTL
///
/// Cloning is cheap and every clone shares the same entries.
pub struct LruCache<K, V> {
    inner: Arc<LruInner<K, V>>,
}

impl<K, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.inner.lock();
        f.debug_struct("LruCache")
            .field("size", &store.entries.len())
            .field("capacity", &store.capacity)
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> LruCache<K, V> {
    /// Create a cache; fails if the capacity or default TTL is invalid.
    pub fn new(config: LruConfig) -> LifecycleResult<Self> {
        config.validate()?;

        let inner = Arc::new(LruInner {
            store: Mutex::new(LruStore {
                entries: RecencyList::with_capacity(config.max_size),
                capacity: config.max_size,
                default_ttl: config.default_ttl(),
            }),
            counters: LruCounters::default(),
            timers: TimerManager::new("lru-cache"),
            sweep: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        if config.enable_gc {
            let weak = Arc::downgrade(&inner);
            let handle = inner
                .timers
                .set_interval(config.sweep_interval(), move || Self::sweep(&weak));
            *inner.sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        Ok(Self { inner })
    }

    /// Cache with only a capacity; no default TTL
    pub fn with_capacity(max_size: usize) -> LifecycleResult<Self> {
        Self::new(LruConfig {
            max_size,
            ..Default::default()
        })
    }

    fn sweep(weak: &Weak<LruInner<K, V>>) {
        let Some(inner) = weak.upgrade() else { return };
        let removed = inner.lock().purge_expired(Instant::now());
        if removed > 0 {
            inner.counters.record_expirations(removed);
            log::debug!("LRU sweep reclaimed {} expired entries", removed);
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Read a value and mark it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        if self.is_disposed() {
            return None;
        }
        let mut store = self.inner.lock();
        let Some(slot) = store.live_slot(key, Instant::now(), &self.inner.counters) else {
            self.inner.counters.record_miss();
            return None;
        };
        store.entries.move_to_front(slot);
        self.inner.counters.record_hit();
        store.entries.entry(slot).map(|entry| entry.value.clone())
    }

    /// Read a value without changing its recency
    pub fn peek(&self, key: &K) -> Option<V> {
        if self.is_disposed() {
            return None;
        }
        let store = self.inner.lock();
        let slot = store.entries.slot_of(key)?;
        store
            .entries
            .entry(slot)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Insert or overwrite `key`. `ttl` falls back to the configured default;
    /// the least recently used entry is evicted when the cache is full.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        if self.is_disposed() {
            log::warn!("LruCache is disposed; ignoring set for {:?}", key);
            return;
        }

        let mut store = self.inner.lock();
        let ttl = ttl.or(store.default_ttl);
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            log::warn!("Zero TTL for {:?}; entry dropped instead of stored", key);
            if let Some(slot) = store.entries.slot_of(&key) {
                store.entries.remove(slot);
            }
            return;
        }
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);

        if let Some(slot) = store.entries.slot_of(&key) {
            if let Some(entry) = store.entries.entry_mut(slot) {
                entry.value = value;
                entry.expires_at = expires_at;
            }
            store.entries.move_to_front(slot);
            return;
        }

        if store.entries.len() >= store.capacity {
            if let Some(evicted) = store.entries.pop_back() {
                self.inner.counters.record_eviction();
                log::trace!("LRU evicted {:?}", evicted.key);
            }
        }
        store
            .entries
            .push_front(CacheEntry::new(key, value, expires_at));
    }

    /// Whether `key` holds a live entry. Does not change recency.
    pub fn has(&self, key: &K) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut store = self.inner.lock();
        store
            .live_slot(key, Instant::now(), &self.inner.counters)
            .is_some()
    }

    /// Remove `key`; returns whether a live entry was removed
    pub fn delete(&self, key: &K) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut store = self.inner.lock();
        match store.live_slot(key, Instant::now(), &self.inner.counters) {
            Some(slot) => store.entries.remove(slot).is_some(),
            None => false,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet reclaimed
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().entries.keys_mru_first()
    }

    /// Drop every expired entry now; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let removed = self.inner.lock().purge_expired(Instant::now());
        self.inner.counters.record_expirations(removed);
        removed
    }

    pub fn stats(&self) -> LruStats {
        let store = self.inner.lock();
        self.inner
            .counters
            .snapshot(store.entries.len(), store.capacity)
    }

    /// Cancel the sweep and drop every entry. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.dispose();
        self.inner
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.clear();
        log::debug!("LruCache disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize) -> LruCache<String, i32> {
        LruCache::new(LruConfig {
            max_size,
            enable_gc: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[test]
    fn test_invalid_capacity_fails_fast() {
        assert!(LruCache::<String, i32>::with_capacity(0).is_err());
    }

    #[test]
    fn test_overflow_evicts_first_inserted() {
        let cache = cache(3);
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.set(key(k), i as i32, None);
        }

        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.get(&key("b")), Some(1));
        assert_eq!(cache.get(&key("c")), Some(2));
        assert_eq!(cache.get(&key("d")), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_is_last_writer_wins_and_bumps() {
        let cache = cache(2);
        cache.set(key("a"), 1, None);
        cache.set(key("b"), 2, None);
        cache.set(key("a"), 10, None);
        cache.set(key("c"), 3, None);

        assert_eq!(cache.get(&key("a")), Some(10));
        assert!(!cache.has(&key("b")));
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_peek_does_not_bump() {
        let cache = cache(2);
        cache.set(key("a"), 1, None);
        cache.set(key("b"), 2, None);
        assert_eq!(cache.peek(&key("a")), Some(1));
        cache.set(key("c"), 3, None);
        assert_eq!(cache.peek(&key("a")), None);
        assert_eq!(cache.keys(), vec![key("c"), key("b")]);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(4);
        cache.set(key("a"), 1, None);
        cache.set(key("b"), 2, None);

        assert!(cache.delete(&key("a")));
        assert!(!cache.delete(&key("a")));
        assert_eq!(cache.size(), 1);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get(&key("b")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_lazily() {
        let cache = cache(4);
        cache.set(key("k"), 7, Some(Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(9)).await;
        assert_eq!(cache.get(&key("k")), Some(7));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get(&key("k")), None);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies_when_unspecified() {
        let cache: LruCache<String, i32> = LruCache::new(LruConfig {
            max_size: 4,
            default_ttl_ms: Some(50),
            enable_gc: false,
            ..Default::default()
        })
        .unwrap();
        cache.set(key("short"), 1, None);
        cache.set(key("long"), 2, Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!cache.has(&key("short")));
        assert!(cache.has(&key("long")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_reclaims_unread_entries() {
        let cache: LruCache<String, i32> = LruCache::new(LruConfig {
            max_size: 8,
            sweep_interval_ms: 100,
            enable_gc: true,
            ..Default::default()
        })
        .unwrap();
        cache.set(key("a"), 1, Some(Duration::from_millis(20)));
        cache.set(key("b"), 2, Some(Duration::from_millis(20)));
        cache.set(key("keep"), 3, None);
        assert_eq!(cache.size(), 3);

        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.size(), 1);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let cache: LruCache<String, i32> = LruCache::new(LruConfig {
            max_size: 2,
            ..Default::default()
        })
        .unwrap();
        cache.set(key("a"), 1, None);

        cache.dispose();
        cache.dispose();

        assert_eq!(cache.size(), 0);
        cache.set(key("b"), 2, None);
        assert_eq!(cache.get(&key("b")), None);
    }
}
