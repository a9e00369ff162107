//! Per-type pool counters and snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    created: CachePadded<AtomicU64>,
    reused: CachePadded<AtomicU64>,
    released: CachePadded<AtomicU64>,
    destroyed: CachePadded<AtomicU64>,
    teardown_failures: CachePadded<AtomicU64>,
}

impl PoolCounters {
    #[inline]
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_destroyed(&self, failed: bool) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, type_name: &'static str, idle: usize, max_size: usize) -> TypePoolStats {
        let created = self.created.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        TypePoolStats {
            type_name,
            created,
            reused,
            released,
            destroyed: self.destroyed.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
            checked_out: (created + reused).saturating_sub(released),
            idle,
            max_size,
        }
    }
}

/// Counters for one pooled type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypePoolStats {
    pub type_name: &'static str,
    /// Instances constructed on a checkout miss
    pub created: u64,
    /// Checkouts served from the idle set
    pub reused: u64,
    pub released: u64,
    /// Instances torn down (pool full, idle sweep, clear or dispose)
    pub destroyed: u64,
    pub teardown_failures: u64,
    /// Instances currently owned by callers
    pub checked_out: u64,
    pub idle: usize,
    pub max_size: usize,
}

impl TypePoolStats {
    /// Share of checkouts served without construction (0.0 to 1.0)
    pub fn reuse_rate(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

/// Snapshot of every registered type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub types: Vec<TypePoolStats>,
}

impl PoolStats {
    pub fn for_type(&self, type_name: &str) -> Option<&TypePoolStats> {
        self.types.iter().find(|stats| stats.type_name == type_name)
    }

    pub fn total_idle(&self) -> usize {
        self.types.iter().map(|stats| stats.idle).sum()
    }

    pub fn total_checked_out(&self) -> u64 {
        self.types.iter().map(|stats| stats.checked_out).sum()
    }
}
