//! Batch execution counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::cache::traits::BatchState;

#[derive(Debug, Default)]
pub(crate) struct BatchCounters {
    runs: CachePadded<AtomicU64>,
    executed: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    cancelled: CachePadded<AtomicU64>,
}

impl BatchCounters {
    pub(crate) fn record_run(&self, executed: u64, failed: u64, dropped: u64) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.executed.fetch_add(executed, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub(crate) fn record_single(&self, failed: bool) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cancelled(&self, count: u64) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, batches: Vec<BatchInfo>) -> BatchStats {
        BatchStats {
            runs: self.runs.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            batches,
        }
    }
}

/// State of one named batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub id: String,
    pub state: BatchState,
    /// Operations waiting for the next run
    pub pending: usize,
    pub auto_flush_scheduled: bool,
    pub age: Duration,
    /// How long the oldest pending operation has waited
    pub oldest_pending: Option<Duration>,
}

/// Manager-wide counters plus the batches that currently exist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub runs: u64,
    /// Operations that were started, including failed ones
    pub executed: u64,
    pub failed: u64,
    /// Operations cut by `max_batch_size`
    pub dropped: u64,
    /// Operations discarded by `cancel_batch` or dispose
    pub cancelled: u64,
    pub batches: Vec<BatchInfo>,
}

impl BatchStats {
    pub fn batch(&self, id: &str) -> Option<&BatchInfo> {
        self.batches.iter().find(|info| info.id == id)
    }

    pub fn pending(&self) -> usize {
        self.batches.iter().map(|info| info.pending).sum()
    }
}
