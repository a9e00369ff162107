//! Idle storage for one pooled type

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use super::statistics::{PoolCounters, TypePoolStats};
use crate::cache::config::PoolConfig;
use crate::cache::traits::Poolable;

/// An idle instance and when it went idle
#[derive(Debug)]
pub(crate) struct PoolSlot<T> {
    pub(crate) instance: T,
    pub(crate) last_used: Instant,
}

/// Type-erased view used by pool-wide passes (sweep, clear, stats)
pub(crate) trait IdleBucket: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn sweep_idle(&self, now: Instant) -> usize;
    fn clear(&self) -> usize;
    fn stats(&self) -> TypePoolStats;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
struct BucketState<T> {
    // Oldest idle instance at the front
    idle: VecDeque<PoolSlot<T>>,
    config: PoolConfig,
}

pub(crate) struct TypeBucket<T> {
    state: Mutex<BucketState<T>>,
    counters: PoolCounters,
}

impl<T: Poolable> TypeBucket<T> {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                idle: VecDeque::with_capacity(config.max_size),
                config,
            }),
            counters: PoolCounters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the type's config, tearing down idle instances beyond the new
    /// capacity (oldest first)
    pub(crate) fn reconfigure(&self, config: PoolConfig) -> usize {
        let excess: Vec<T> = {
            let mut state = self.lock();
            state.config = config;
            let excess = state.idle.len().saturating_sub(state.config.max_size);
            state.idle.drain(..excess).map(|slot| slot.instance).collect()
        };
        self.destroy_all(excess)
    }

    /// Pop the most recently released instance. Removal from the idle set and
    /// handing the instance out happen under one lock.
    pub(crate) fn checkout(&self) -> Option<T> {
        let slot = self.lock().idle.pop_back()?;
        self.counters.record_reused();
        Some(slot.instance)
    }

    pub(crate) fn record_created(&self) {
        self.counters.record_created();
    }

    /// Return an instance to the idle set, or hand it back if the set is full
    pub(crate) fn checkin(&self, instance: T, now: Instant) -> Result<(), T> {
        let mut state = self.lock();
        self.counters.record_released();
        if state.idle.len() >= state.config.max_size {
            return Err(instance);
        }
        state.idle.push_back(PoolSlot {
            instance,
            last_used: now,
        });
        Ok(())
    }

    /// Add pristine instances up to capacity; returns how many were added
    pub(crate) fn fill(&self, count: usize, now: Instant) -> usize {
        let mut state = self.lock();
        let room = state.config.max_size.saturating_sub(state.idle.len());
        let added = count.min(room);
        for _ in 0..added {
            state.idle.push_back(PoolSlot {
                instance: T::pristine(),
                last_used: now,
            });
        }
        added
    }

    /// Tear down an instance the pool is not keeping; failures are logged
    pub(crate) fn destroy(&self, mut instance: T) {
        let outcome = catch_unwind(AssertUnwindSafe(|| instance.teardown()));
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(error)) => {
                log::error!("Teardown of pooled {} failed: {}", self.type_name(), error);
                true
            }
            Err(_) => {
                log::error!("Teardown of pooled {} panicked", self.type_name());
                true
            }
        };
        self.counters.record_destroyed(failed);
    }

    fn destroy_all(&self, instances: Vec<T>) -> usize {
        let count = instances.len();
        for instance in instances {
            self.destroy(instance);
        }
        count
    }
}

impl<T: Poolable> IdleBucket for TypeBucket<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn sweep_idle(&self, now: Instant) -> usize {
        let expired: Vec<T> = {
            let mut state = self.lock();
            if !state.config.enable_gc {
                return 0;
            }
            let max_idle = state.config.max_idle_time();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|slot| now.saturating_duration_since(slot.last_used) > max_idle);
            state.idle = fresh;
            stale.into_iter().map(|slot| slot.instance).collect()
        };
        self.destroy_all(expired)
    }

    fn clear(&self) -> usize {
        let idle: Vec<T> = self
            .lock()
            .idle
            .drain(..)
            .map(|slot| slot.instance)
            .collect();
        self.destroy_all(idle)
    }

    fn stats(&self) -> TypePoolStats {
        let (idle, max_size) = {
            let state = self.lock();
            (state.idle.len(), state.config.max_size)
        };
        self.counters.snapshot(self.type_name(), idle, max_size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
