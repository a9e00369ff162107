//! Public facade for one logical owner
//!
//! `ResourceFacade` wires an LRU cache, a persistence adapter, write-behind
//! batching, debounced persistence and throttled change notifications for a
//! single owner, and exposes one `dispose()` that tears all of it down.
//! Pooled instances come from the injected `ResourceRegistry`.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::cache::batch::{BatchManager, BatchStats};
use crate::cache::config::{BatchConfig, LifecycleConfig, PoolConfig};
use crate::cache::coordinator::{Debouncer, MemoryPersistence, PersistenceAdapter, Throttler};
use crate::cache::lifecycle::{SubscriptionId, SubscriptionManager, TimerManager};
use crate::cache::lru::{LruCache, LruStats};
use crate::cache::pool::ObjectPool;
use crate::cache::registry::ResourceRegistry;
use crate::cache::traits::{
    CacheValue, LifecycleError, LifecycleResult, OperationError, Poolable,
};

/// Debounce key for the write-behind flush
const PERSIST_KEY: &str = "persist";

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
enum PendingWrite<V> {
    Save(V),
    Remove,
}

impl<V> PendingWrite<V> {
    fn into_value(self) -> Option<V> {
        match self {
            PendingWrite::Save(value) => Some(value),
            PendingWrite::Remove => None,
        }
    }
}

/// Snapshot of a facade's components
#[derive(Debug, Clone)]
pub struct FacadeStats {
    pub cache: LruStats,
    pub batches: BatchStats,
    /// Mutations not yet handed to the persistence adapter
    pub pending_writes: usize,
    pub listeners: usize,
    pub active_timers: usize,
}

struct FacadeInner<V> {
    owner_id: String,
    key_ttls: BTreeMap<String, Duration>,
    cache: LruCache<String, V>,
    persistence: Arc<dyn PersistenceAdapter<V>>,
    batches: BatchManager,
    timers: TimerManager,
    subscriptions: SubscriptionManager,
    debouncer: Debouncer<String>,
    throttler: Throttler<String>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener: AtomicU64,
    dirty: Mutex<HashMap<String, PendingWrite<V>>>,
    /// Writes handed to the batch whose adapter call may not have finished
    in_flight: Mutex<HashMap<String, PendingWrite<V>>>,
    /// Bumped each time in-flight writes are released
    settled: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    registry: ResourceRegistry,
    disposed: AtomicBool,
}

impl<V: CacheValue> FacadeInner<V> {
    fn dirty(&self) -> MutexGuard<'_, HashMap<String, PendingWrite<V>>> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, PendingWrite<V>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest write for `key` the adapter may not hold yet. Takes `in_flight`
    /// while the caller holds `dirty`.
    fn unpersisted(
        &self,
        dirty: &HashMap<String, PendingWrite<V>>,
        key: &str,
    ) -> Option<PendingWrite<V>> {
        dirty
            .get(key)
            .cloned()
            .or_else(|| self.in_flight().get(key).cloned())
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ttl_for(&self, key: &str) -> Option<Duration> {
        self.key_ttls.get(key).copied()
    }

    /// Apply `write` to the cache and queue it for persistence. Returns
    /// whether the cache held `key` before a removal.
    fn record_write(self: &Arc<Self>, key: &str, write: PendingWrite<V>) -> bool {
        let existed = {
            let mut dirty = self.dirty();
            let existed = match &write {
                PendingWrite::Save(value) => {
                    self.cache
                        .set(key.to_string(), value.clone(), self.ttl_for(key));
                    false
                }
                PendingWrite::Remove => self.cache.delete(&key.to_string()),
            };
            dirty.insert(key.to_string(), write);
            existed
        };

        let weak = Arc::downgrade(self);
        self.debouncer.call_async(PERSIST_KEY.to_string(), async move {
            if let Some(inner) = weak.upgrade() {
                if let Err(error) = FacadeInner::flush(inner).await {
                    log::error!("Write-behind flush failed: {}", error);
                }
            }
        });
        self.notify(key);
        existed
    }

    fn notify(self: &Arc<Self>, key: &str) {
        let weak = Arc::downgrade(self);
        let owned_key = key.to_string();
        self.throttler
            .call(key.to_string(), move || Self::dispatch(&weak, &owned_key));
    }

    fn dispatch(weak: &Weak<Self>, key: &str) {
        let Some(inner) = weak.upgrade() else { return };
        let listeners: Vec<Listener> = inner.listeners().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(key))).is_err() {
                log::error!("Change listener for '{}' panicked on '{}'", inner.owner_id, key);
            }
        }
    }

    /// Hand every pending write to the persistence adapter through the
    /// owner's batch. Returns how many writes were submitted.
    async fn flush(inner: Arc<Self>) -> LifecycleResult<usize> {
        let _serial = inner.flush_lock.lock().await;

        let writes: Vec<(String, PendingWrite<V>)> = {
            let mut dirty = inner.dirty();
            let writes: Vec<_> = dirty.drain().collect();
            let mut in_flight = inner.in_flight();
            for (key, write) in &writes {
                in_flight.insert(key.clone(), write.clone());
            }
            writes
        };
        if writes.is_empty() {
            return Ok(0);
        }
        let _landed = InFlight {
            inner: &inner,
            keys: writes.iter().map(|(key, _)| key.clone()).collect(),
        };

        let count = writes.len();
        for (key, write) in writes {
            let adapter = Arc::clone(&inner.persistence);
            inner.batches.add_operation(
                &inner.owner_id,
                move || async move {
                    let result = match write {
                        PendingWrite::Save(value) => adapter.save(&key, &value),
                        PendingWrite::Remove => adapter.remove(&key),
                    };
                    result.map_err(OperationError::from)
                },
                0,
            );
        }
        inner.batches.execute_batch(&inner.owner_id).await;

        log::debug!("Owner '{}' persisted {} writes", inner.owner_id, count);
        Ok(count)
    }
}

/// Releases in-flight writes once their batch run ends or the flush is dropped
struct InFlight<'a, V: CacheValue> {
    inner: &'a FacadeInner<V>,
    keys: Vec<String>,
}

impl<V: CacheValue> Drop for InFlight<'_, V> {
    fn drop(&mut self) {
        {
            let mut in_flight = self.inner.in_flight();
            for key in &self.keys {
                in_flight.remove(key);
            }
        }
        self.inner.settled.fetch_add(1, Ordering::AcqRel);
    }
}

/// Cache, persistence and lifecycle management for one owner
///
/// Clones share the same components; `dispose()` on any clone disposes them
/// all, exactly once.
pub struct ResourceFacade<V> {
    inner: Arc<FacadeInner<V>>,
}

impl<V> Clone for ResourceFacade<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for ResourceFacade<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceFacade")
            .field("owner_id", &self.inner.owner_id)
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: CacheValue> ResourceFacade<V> {
    /// Create a builder with default configuration
    pub fn builder() -> ResourceFacadeBuilder<V> {
        ResourceFacadeBuilder::new()
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Read `key`, falling back to the persistence adapter on a cache miss.
    /// A value loaded from the adapter is cached. Writes the adapter may not
    /// hold yet win over what it returns.
    pub fn get(&self, key: &str) -> LifecycleResult<Option<V>> {
        if self.inner.is_disposed() {
            log::warn!("ResourceFacade '{}' is disposed; get('{}') misses", self.inner.owner_id, key);
            return Ok(None);
        }
        if let Some(value) = self.inner.cache.get(&key.to_string()) {
            return Ok(Some(value));
        }

        loop {
            let settled = self.inner.settled.load(Ordering::Acquire);
            if let Some(write) = self.inner.unpersisted(&self.inner.dirty(), key) {
                return Ok(write.into_value());
            }

            let loaded = self.inner.persistence.load(key)?;

            // Recheck under `dirty`: writers update the cache while holding it
            let dirty = self.inner.dirty();
            if let Some(write) = self.inner.unpersisted(&dirty, key) {
                return Ok(write.into_value());
            }
            // A flush landed while loading; the adapter may have changed
            if self.inner.settled.load(Ordering::Acquire) != settled {
                continue;
            }
            if let Some(value) = &loaded {
                self.inner
                    .cache
                    .set(key.to_string(), value.clone(), self.inner.ttl_for(key));
            }
            return Ok(loaded);
        }
    }

    /// Write `key` to the cache now and to persistence after the persist delay
    pub fn set(&self, key: &str, value: V) {
        if self.inner.is_disposed() {
            log::warn!("ResourceFacade '{}' is disposed; ignoring set('{}')", self.inner.owner_id, key);
            return;
        }
        self.inner.record_write(key, PendingWrite::Save(value));
    }

    /// Remove `key` from the cache now and from persistence after the persist
    /// delay. Returns whether the cache held it.
    pub fn delete(&self, key: &str) -> bool {
        if self.inner.is_disposed() {
            log::warn!("ResourceFacade '{}' is disposed; ignoring delete('{}')", self.inner.owner_id, key);
            return false;
        }
        self.inner.record_write(key, PendingWrite::Remove)
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.cache.has(&key.to_string())
    }

    /// Drop every cached entry. Persisted values are untouched.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Persist pending writes now instead of waiting for the persist delay
    pub async fn flush(&self) -> LifecycleResult<usize> {
        if self.inner.is_disposed() {
            return Err(LifecycleError::Disposed("ResourceFacade"));
        }
        self.inner.debouncer.cancel(&PERSIST_KEY.to_string());
        FacadeInner::flush(Arc::clone(&self.inner)).await
    }

    /// Flush pending writes, then dispose
    pub async fn close(&self) -> LifecycleResult<usize> {
        let persisted = self.flush().await?;
        self.dispose();
        Ok(persisted)
    }

    /// Call `listener` with the key of every change, at most once per key per
    /// notify interval plus one trailing call
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.inner.is_disposed() {
            return self.inner.subscriptions.add(|| {});
        }
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().insert(id, Arc::new(listener));

        let weak = Arc::downgrade(&self.inner);
        self.inner.subscriptions.add(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners().remove(&id);
            }
        })
    }

    /// Returns whether the subscription was still active
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.remove(id)
    }

    /// Timers created on behalf of this owner; cancelled by `dispose()`
    pub fn timers(&self) -> &TimerManager {
        &self.inner.timers
    }

    /// External subscriptions owned by this facade; unsubscribed by `dispose()`
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn batches(&self) -> &BatchManager {
        &self.inner.batches
    }

    pub fn pool(&self) -> &ObjectPool {
        self.inner.registry.pool()
    }

    /// Check out a pooled instance from the shared registry
    pub fn acquire<T: Poolable>(&self, id: T::Id, args: T::Args) -> T {
        self.inner.registry.pool().acquire(id, args)
    }

    pub fn release<T: Poolable>(&self, instance: T) {
        self.inner.registry.pool().release(instance)
    }

    pub fn stats(&self) -> FacadeStats {
        FacadeStats {
            cache: self.inner.cache.stats(),
            batches: self.inner.batches.get_stats(None),
            pending_writes: self.inner.dirty().len(),
            listeners: self.inner.listeners().len(),
            active_timers: self.inner.timers.active_count(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Tear down every owned component exactly once. Writes still pending
    /// are dropped; use `close()` to persist them first. The shared registry
    /// is not disposed.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.debouncer.cancel_all();
        self.inner.throttler.cancel_all();
        self.inner.timers.dispose();
        self.inner.batches.dispose();
        self.inner.subscriptions.dispose();
        self.inner.cache.dispose();
        self.inner.listeners().clear();

        let dropped = self.inner.dirty().drain().count();
        if dropped > 0 {
            log::warn!(
                "ResourceFacade '{}' disposed with {} unpersisted writes",
                self.inner.owner_id,
                dropped
            );
        }
        log::debug!("ResourceFacade '{}' disposed", self.inner.owner_id);
    }
}

type PoolRegistration = Box<dyn FnOnce(&ObjectPool) -> LifecycleResult<()> + Send>;

/// Builder for `ResourceFacade`
pub struct ResourceFacadeBuilder<V> {
    config: LifecycleConfig,
    persistence: Option<Arc<dyn PersistenceAdapter<V>>>,
    registry: Option<ResourceRegistry>,
    pool_types: Vec<PoolRegistration>,
}

impl<V: CacheValue> ResourceFacadeBuilder<V> {
    /// Create new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LifecycleConfig::default(),
            persistence: None,
            registry: None,
            pool_types: Vec::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML or JSON file
    pub fn config_file(mut self, path: impl AsRef<Path>) -> LifecycleResult<Self> {
        self.config = LifecycleConfig::from_file(path)?;
        Ok(self)
    }

    /// Set the owner id (also the write-behind batch id)
    pub fn owner<S: Into<String>>(mut self, owner_id: S) -> Self {
        self.config.facade.owner_id = owner_id.into();
        self
    }

    /// Set cache capacity
    pub fn cache_max_size(mut self, max_size: usize) -> Self {
        self.config.cache.max_size = max_size;
        self
    }

    /// TTL for keys without an explicit one
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.default_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    /// Explicit TTL for one cache key
    pub fn key_ttl<S: Into<String>>(mut self, key: S, ttl: Duration) -> Self {
        self.config
            .facade
            .key_ttls_ms
            .insert(key.into(), ttl.as_millis() as u64);
        self
    }

    /// Delay between the last mutation and the write-behind flush
    pub fn persist_delay(mut self, delay: Duration) -> Self {
        self.config.facade.persist_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Window for throttled change notifications
    pub fn notify_interval(mut self, interval: Duration) -> Self {
        self.config.facade.notify_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable the cache's background expiry sweep
    pub fn cache_gc(mut self, enabled: bool) -> Self {
        self.config.cache.enable_gc = enabled;
        self
    }

    pub fn persistence<P: PersistenceAdapter<V>>(mut self, adapter: P) -> Self {
        self.persistence = Some(Arc::new(adapter));
        self
    }

    /// Share an adapter the caller keeps a handle to
    pub fn shared_persistence(mut self, adapter: Arc<dyn PersistenceAdapter<V>>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    /// Inject the registry; without one the process-wide registry is used
    pub fn registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a pooled type with its own pool configuration
    pub fn pool_type<T: Poolable>(mut self, config: PoolConfig) -> Self {
        self.pool_types
            .push(Box::new(move |pool: &ObjectPool| pool.register::<T>(config)));
        self
    }

    /// Validate the configuration and wire every component
    pub fn build(self) -> LifecycleResult<ResourceFacade<V>> {
        let Self {
            config,
            persistence,
            registry,
            pool_types,
        } = self;
        config.validate()?;

        let registry = registry.unwrap_or_else(|| ResourceRegistry::global().clone());
        for register in pool_types {
            register(registry.pool())?;
        }

        let cache = LruCache::new(config.cache.clone())?;
        // The facade drives its own flushes and every drained write must run
        let batches = BatchManager::new(BatchConfig {
            auto_execute: false,
            max_batch_size: None,
            ..config.batch.clone()
        })?;

        let owner_id = config.facade.owner_id.clone();
        let timers = TimerManager::new(format!("facade:{}", owner_id));
        let debouncer = Debouncer::new(config.facade.persist_delay(), timers.clone());
        let throttler = Throttler::new(config.facade.notify_interval(), timers.clone());
        let key_ttls = config
            .facade
            .key_ttls_ms
            .keys()
            .filter_map(|key| config.facade.ttl_for(key).map(|ttl| (key.clone(), ttl)))
            .collect();

        log::debug!("Building ResourceFacade for owner '{}'", owner_id);
        Ok(ResourceFacade {
            inner: Arc::new(FacadeInner {
                subscriptions: SubscriptionManager::new(format!("facade:{}", owner_id)),
                owner_id,
                key_ttls,
                cache,
                persistence: persistence.unwrap_or_else(|| {
                    Arc::new(MemoryPersistence::<V>::new()) as Arc<dyn PersistenceAdapter<V>>
                }),
                batches,
                timers,
                debouncer,
                throttler,
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(1),
                dirty: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                settled: AtomicU64::new(0),
                flush_lock: tokio::sync::Mutex::new(()),
                registry,
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

impl<V: CacheValue> Default for ResourceFacadeBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn facade(store: Arc<MemoryPersistence<i32>>) -> ResourceFacade<i32> {
        ResourceFacade::builder()
            .owner("doc-1")
            .cache_max_size(2)
            .cache_gc(false)
            .persist_delay(Duration::from_millis(100))
            .shared_persistence(store)
            .registry(
                ResourceRegistry::new(PoolConfig {
                    enable_gc: false,
                    ..Default::default()
                })
                .unwrap(),
            )
            .build()
            .unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_behind_is_debounced() {
        let store = Arc::new(MemoryPersistence::new());
        let facade = facade(store.clone());

        facade.set("a", 1);
        facade.set("a", 2);
        facade.set("b", 3);
        assert_eq!(facade.get("a").unwrap(), Some(2));
        assert!(store.is_empty());
        assert_eq!(facade.stats().pending_writes, 2);

        tokio::time::advance(Duration::from_millis(110)).await;
        settle().await;
        assert_eq!(store.stored("a"), Some(2));
        assert_eq!(store.stored("b"), Some(3));
        assert_eq!(facade.stats().pending_writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_through_on_miss() {
        let store = Arc::new(MemoryPersistence::new());
        store.save("persisted", &42).unwrap();
        let facade = facade(store);

        assert!(!facade.has("persisted"));
        assert_eq!(facade.get("persisted").unwrap(), Some(42));
        assert!(facade.has("persisted"));
        assert_eq!(facade.get("missing").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_delete_hides_persisted_value() {
        let store = Arc::new(MemoryPersistence::new());
        store.save("k", &1).unwrap();
        let facade = facade(store.clone());

        assert_eq!(facade.get("k").unwrap(), Some(1));
        assert!(facade.delete("k"));
        assert_eq!(facade.get("k").unwrap(), None);

        assert_eq!(facade.flush().await.unwrap(), 1);
        assert_eq!(store.stored("k"), None);
    }

    /// Adapter whose saves block until the test releases them
    struct GatedStore {
        values: MemoryPersistence<i32>,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl PersistenceAdapter<i32> for GatedStore {
        fn load(&self, key: &str) -> LifecycleResult<Option<i32>> {
            self.values.load(key)
        }

        fn save(&self, key: &str, value: &i32) -> LifecycleResult<()> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.values.save(key, value)
        }

        fn remove(&self, key: &str) -> LifecycleResult<()> {
            self.values.remove(key)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_see_writes_while_flush_is_saving() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(GatedStore {
            values: MemoryPersistence::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        store.values.save("a", &0).unwrap();

        let facade: ResourceFacade<i32> = ResourceFacade::builder()
            .owner("doc-gated")
            .cache_max_size(1)
            .cache_gc(false)
            .persist_delay(Duration::from_secs(60))
            .shared_persistence(store.clone())
            .registry(
                ResourceRegistry::new(PoolConfig {
                    enable_gc: false,
                    ..Default::default()
                })
                .unwrap(),
            )
            .build()
            .unwrap();

        facade.set("a", 1);
        facade.set("b", 2);
        assert!(!facade.has("a"));

        let flushing = tokio::spawn({
            let facade = facade.clone();
            async move { facade.flush().await }
        });
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(facade.get("a").unwrap(), Some(1));
        assert!(!facade.has("a"));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(flushing.await.unwrap().unwrap(), 2);

        assert_eq!(store.values.stored("a"), Some(1));
        assert_eq!(facade.get("a").unwrap(), Some(1));
        facade.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ignores_batch_size_limit() {
        let store = Arc::new(MemoryPersistence::new());
        let mut config = LifecycleConfig::default();
        config.batch.max_batch_size = Some(2);
        let facade: ResourceFacade<i32> = ResourceFacade::builder()
            .config(config)
            .cache_gc(false)
            .shared_persistence(store.clone())
            .registry(
                ResourceRegistry::new(PoolConfig {
                    enable_gc: false,
                    ..Default::default()
                })
                .unwrap(),
            )
            .build()
            .unwrap();

        facade.set("a", 1);
        facade.set("b", 2);
        facade.set("c", 3);

        assert_eq!(facade.flush().await.unwrap(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(facade.stats().pending_writes, 0);
        assert_eq!(facade.batches().get_stats(None).dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_then_disposes() {
        let store = Arc::new(MemoryPersistence::new());
        let facade = facade(store.clone());
        facade.set("x", 9);

        assert_eq!(facade.close().await.unwrap(), 1);
        assert_eq!(store.stored("x"), Some(9));
        assert!(facade.is_disposed());
        assert!(matches!(
            facade.flush().await,
            Err(LifecycleError::Disposed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_are_throttled_and_disposed() {
        let facade = facade(Arc::new(MemoryPersistence::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        facade.subscribe(move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        facade.set("k", 1);
        facade.set("k", 2);
        facade.set("k", 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        facade.dispose();
        facade.dispose();
        assert_eq!(facade.stats().listeners, 0);
        assert_eq!(facade.subscriptions().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cascades_once() {
        let store = Arc::new(MemoryPersistence::new());
        let facade = facade(store.clone());
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let counter = unsubscribed.clone();
        facade.subscriptions().add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        facade.timers().set_interval(Duration::from_millis(10), || {});
        facade.set("a", 1);

        let other = facade.clone();
        facade.dispose();
        other.dispose();

        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(facade.timers().active_count(), 0);
        assert!(facade.batches().is_disposed());
        assert_eq!(facade.get("a").unwrap(), None);

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert!(store.is_empty());
    }
}
