//! Type-keyed object pool with checkout/release and idle sweep
//!
//! Each pooled type gets its own bucket of idle instances, created on first
//! use with the pool-wide `PoolConfig` or registered up front with an
//! override. The bucket owns idle instances outright; a checked-out instance
//! is owned by the caller until it is passed back to `release`, so an
//! instance can never be held by two owners at once.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::time::Instant;

use super::bucket::{IdleBucket, TypeBucket};
use super::statistics::{PoolStats, TypePoolStats};
use crate::cache::config::PoolConfig;
use crate::cache::lifecycle::TimerManager;
use crate::cache::traits::{LifecycleResult, Poolable};

struct PoolInner {
    config: PoolConfig,
    buckets: DashMap<TypeId, Arc<dyn IdleBucket>>,
    timers: TimerManager,
    disposed: AtomicBool,
}

impl PoolInner {
    fn sweep_idle(&self, now: Instant) -> usize {
        let buckets: Vec<Arc<dyn IdleBucket>> =
            self.buckets.iter().map(|entry| Arc::clone(entry.value())).collect();
        let removed: usize = buckets.iter().map(|bucket| bucket.sweep_idle(now)).sum();
        if removed > 0 {
            log::debug!("Pool idle sweep tore down {} instances", removed);
        }
        removed
    }

    fn clear(&self) -> usize {
        let buckets: Vec<Arc<dyn IdleBucket>> =
            self.buckets.iter().map(|entry| Arc::clone(entry.value())).collect();
        buckets.iter().map(|bucket| bucket.clear()).sum()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Backstop only: owners are expected to call dispose()
        if !self.disposed.load(Ordering::Acquire) {
            self.clear();
        }
    }
}

/// Pool of reusable instances keyed by type
#[derive(Clone)]
pub struct ObjectPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("types", &self.inner.buckets.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ObjectPool {
    /// Create a pool; `config` is the default for every type not registered
    /// explicitly. Starts the idle sweep when `enable_gc` is set.
    pub fn new(config: PoolConfig) -> LifecycleResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            buckets: DashMap::new(),
            timers: TimerManager::new("object-pool"),
            disposed: AtomicBool::new(false),
        });

        if inner.config.enable_gc {
            let weak: Weak<PoolInner> = Arc::downgrade(&inner);
            inner
                .timers
                .set_interval(inner.config.sweep_interval(), move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.sweep_idle(Instant::now());
                    }
                });
        }

        Self { inner }
    }

    /// Override the configuration for one type. Idle instances beyond the new
    /// capacity are torn down.
    pub fn register<T: Poolable>(&self, config: PoolConfig) -> LifecycleResult<()> {
        config.validate()?;
        let key = TypeId::of::<T>();
        let existing = self.inner.buckets.get(&key).map(|entry| Arc::clone(entry.value()));
        match existing {
            Some(bucket) => {
                if let Some(bucket) = bucket.as_any().downcast_ref::<TypeBucket<T>>() {
                    bucket.reconfigure(config);
                }
            }
            None => {
                self.inner
                    .buckets
                    .insert(key, Arc::new(TypeBucket::<T>::new(config)));
            }
        }
        Ok(())
    }

    fn bucket<T: Poolable>(&self) -> Arc<dyn IdleBucket> {
        let entry = self
            .inner
            .buckets
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                Arc::new(TypeBucket::<T>::new(self.inner.config.clone())) as Arc<dyn IdleBucket>
            });
        Arc::clone(entry.value())
    }

    fn with_bucket<T: Poolable, R>(&self, f: impl FnOnce(&TypeBucket<T>) -> R) -> Option<R> {
        let bucket = self.bucket::<T>();
        bucket.as_any().downcast_ref::<TypeBucket<T>>().map(f)
    }

    /// Check out an instance representing `id`: an idle instance reset in
    /// place if one exists, otherwise a new one.
    pub fn acquire<T: Poolable>(&self, id: T::Id, args: T::Args) -> T {
        if self.is_disposed() {
            log::warn!(
                "ObjectPool is disposed; constructing unpooled {}",
                std::any::type_name::<T>()
            );
            return T::create(id, args);
        }

        let reused = self.with_bucket::<T, _>(|bucket| match bucket.checkout() {
            Some(instance) => Some(instance),
            None => {
                bucket.record_created();
                None
            }
        });

        match reused.flatten() {
            Some(mut instance) => {
                instance.reset(id, args);
                instance
            }
            None => T::create(id, args),
        }
    }

    /// Return an instance. It is cleared and kept idle if its type has room,
    /// otherwise torn down immediately. The caller must not keep using it.
    pub fn release<T: Poolable>(&self, mut instance: T) {
        if self.is_disposed() {
            log::warn!(
                "ObjectPool is disposed; tearing down released {}",
                std::any::type_name::<T>()
            );
            if let Err(error) = instance.teardown() {
                log::error!("Teardown after dispose failed: {}", error);
            }
            return;
        }

        instance.clear();
        let checked_in = self.with_bucket::<T, _>(|bucket| {
            if let Err(rejected) = bucket.checkin(instance, Instant::now()) {
                log::debug!(
                    "Idle pool for {} is full; tearing down released instance",
                    std::any::type_name::<T>()
                );
                bucket.destroy(rejected);
            }
        });
        if checked_in.is_none() {
            log::error!(
                "Pool bucket type mismatch for {}",
                std::any::type_name::<T>()
            );
        }
    }

    /// Pre-populate the idle set with pristine instances, up to capacity.
    /// Returns how many were added.
    pub fn warm_up<T: Poolable>(&self, count: usize) -> usize {
        if self.is_disposed() {
            log::warn!("ObjectPool is disposed; ignoring warm_up");
            return 0;
        }
        self.with_bucket::<T, _>(|bucket| bucket.fill(count, Instant::now()))
            .unwrap_or(0)
    }

    pub fn idle_count<T: Poolable>(&self) -> usize {
        self.inner
            .buckets
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().stats().idle)
            .unwrap_or(0)
    }

    /// Run the idle sweep now; returns how many instances were torn down
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle(Instant::now())
    }

    /// Tear down every idle instance of every type
    pub fn clear(&self) -> usize {
        self.inner.clear()
    }

    pub fn get_stats(&self) -> PoolStats {
        let mut types: Vec<TypePoolStats> = self
            .inner
            .buckets
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        types.sort_by(|a, b| a.type_name.cmp(b.type_name));
        PoolStats { types }
    }

    /// Counters for one type, if it has been used or registered
    pub fn stats_for<T: Poolable>(&self) -> Option<TypePoolStats> {
        self.inner
            .buckets
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().stats())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stop the sweep and tear down every idle instance. Safe to call
    /// repeatedly.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.dispose();
        let destroyed = self.inner.clear();
        log::debug!("ObjectPool disposed, tore down {} idle instances", destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::LifecycleError;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    static SERIAL: AtomicU64 = AtomicU64::new(1);

    #[derive(Debug)]
    struct Connection {
        serial: u64,
        owner: Option<String>,
        teardowns: Option<Arc<AtomicUsize>>,
    }

    impl Poolable for Connection {
        type Id = String;
        type Args = Option<Arc<AtomicUsize>>;

        fn create(id: String, teardowns: Self::Args) -> Self {
            Self {
                serial: SERIAL.fetch_add(1, Ordering::Relaxed),
                owner: Some(id),
                teardowns,
            }
        }

        fn reset(&mut self, id: String, teardowns: Self::Args) {
            self.owner = Some(id);
            if teardowns.is_some() {
                self.teardowns = teardowns;
            }
        }

        fn clear(&mut self) {
            self.owner = None;
        }

        fn pristine() -> Self {
            Self {
                serial: SERIAL.fetch_add(1, Ordering::Relaxed),
                owner: None,
                teardowns: None,
            }
        }

        fn teardown(&mut self) -> LifecycleResult<()> {
            if let Some(counter) = &self.teardowns {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Flaky;

    impl Poolable for Flaky {
        type Id = ();
        type Args = ();

        fn create(_: (), _: ()) -> Self {
            Flaky
        }
        fn reset(&mut self, _: (), _: ()) {}
        fn clear(&mut self) {}
        fn pristine() -> Self {
            Flaky
        }
        fn teardown(&mut self) -> LifecycleResult<()> {
            Err(LifecycleError::teardown_failed("socket already closed"))
        }
    }

    fn pool(max_size: usize) -> ObjectPool {
        ObjectPool::new(PoolConfig {
            max_size,
            enable_gc: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_acquire_distinct_then_reuse() {
        let pool = pool(4);
        let a: Connection = pool.acquire("a".into(), None);
        let b: Connection = pool.acquire("b".into(), None);
        assert_ne!(a.serial, b.serial);

        let a_serial = a.serial;
        pool.release(a);
        let again: Connection = pool.acquire("c".into(), None);
        assert_eq!(again.serial, a_serial);
        assert_eq!(again.owner.as_deref(), Some("c"));

        let stats = pool.stats_for::<Connection>().unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.checked_out, 2);
    }

    #[test]
    fn test_release_beyond_capacity_tears_down_once() {
        let pool = pool(2);
        let teardowns = Arc::new(AtomicUsize::new(0));
        let instances: Vec<Connection> = (0..3)
            .map(|i| pool.acquire(format!("c{i}"), Some(teardowns.clone())))
            .collect();

        for instance in instances {
            pool.release(instance);
        }

        assert_eq!(pool.idle_count::<Connection>(), 2);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_failure_is_isolated() {
        let pool = pool(1);
        let first: Flaky = pool.acquire((), ());
        let second: Flaky = pool.acquire((), ());
        pool.release(first);
        pool.release(second);

        let stats = pool.stats_for::<Flaky>().unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.teardown_failures, 1);

        let _again: Flaky = pool.acquire((), ());
        assert_eq!(pool.idle_count::<Flaky>(), 0);
    }

    #[test]
    fn test_warm_up_respects_capacity() {
        let pool = pool(3);
        assert_eq!(pool.warm_up::<Connection>(5), 3);
        assert_eq!(pool.warm_up::<Connection>(1), 0);

        let conn: Connection = pool.acquire("warm".into(), None);
        assert_eq!(conn.owner.as_deref(), Some("warm"));
        assert_eq!(pool.stats_for::<Connection>().unwrap().created, 0);
    }

    #[test]
    fn test_register_overrides_capacity() {
        let pool = pool(10);
        pool.warm_up::<Connection>(5);
        pool.register::<Connection>(PoolConfig {
            max_size: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pool.idle_count::<Connection>(), 2);

        assert!(
            pool.register::<Connection>(PoolConfig {
                max_size: 0,
                ..Default::default()
            })
            .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_removes_stale_instances() {
        let pool = ObjectPool::new(PoolConfig {
            max_size: 4,
            max_idle_time_ms: 100,
            enable_gc: true,
        })
        .unwrap();
        let teardowns = Arc::new(AtomicUsize::new(0));
        let old: Connection = pool.acquire("old".into(), Some(teardowns.clone()));
        pool.release(old);

        tokio::time::advance(Duration::from_millis(60)).await;
        let fresh: Connection = pool.acquire("fresh".into(), Some(teardowns.clone()));
        let other: Connection = pool.acquire("other".into(), Some(teardowns.clone()));
        pool.release(fresh);
        pool.release(other);
        assert_eq!(pool.idle_count::<Connection>(), 2);

        // Sweeps run every 50ms; both instances went idle at 60ms
        tokio::time::advance(Duration::from_millis(90)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.idle_count::<Connection>(), 2);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.idle_count::<Connection>(), 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_tears_down_idle_and_is_idempotent() {
        let pool = pool(4);
        let teardowns = Arc::new(AtomicUsize::new(0));
        let a: Connection = pool.acquire("a".into(), Some(teardowns.clone()));
        let b: Connection = pool.acquire("b".into(), Some(teardowns.clone()));
        pool.release(a);

        pool.dispose();
        pool.dispose();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        pool.release(b);
        assert_eq!(teardowns.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count::<Connection>(), 0);
    }
}
