//! Named batches of deferred operations with priority ordering and
//! auto-flush scheduling
//!
//! A flush snapshots the queued operations and runs them one after another.
//! Each operation runs in its own task, so an error or panic is logged and the
//! rest of the run continues. Operations enqueued under an id while that id is
//! flushing are kept for the next run instead of joining the current one.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::queue::{BatchQueue, BoxedOperation, FlushOptions, QueuedOperation, boxed, plan_run};
use super::statistics::{BatchCounters, BatchInfo, BatchStats};
use crate::cache::config::BatchConfig;
use crate::cache::lifecycle::{TimerHandle, TimerManager};
use crate::cache::traits::{BatchState, LifecycleResult, OperationResult};

struct BatchInner {
    config: BatchConfig,
    queues: Mutex<HashMap<String, BatchQueue>>,
    timers: TimerManager,
    counters: BatchCounters,
    /// Flushes in progress across all ids
    running: AtomicUsize,
    idle: Notify,
    anonymous: AtomicU64,
    disposed: AtomicBool,
}

/// Finishes a run even if the flushing future is dropped or unwinds
struct RunGuard {
    inner: Arc<BatchInner>,
    id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.finish_run(&self.id);
    }
}

impl BatchInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BatchQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn schedule_auto_flush(self: &Arc<Self>, id: &str, queue: &mut BatchQueue) {
        let weak = Arc::downgrade(self);
        let owned_id = id.to_string();
        let handle = self
            .timers
            .spawn_timeout(queue.config.auto_execute_delay(), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.take_auto_flush(&owned_id);
                    // The run outlives the timer so dispose cannot cut it short
                    tokio::spawn(BatchInner::execute(inner, owned_id, None));
                }
            });
        if !handle.is_inert() {
            queue.auto_flush = Some(handle);
        }
    }

    // Forget the handle without aborting it: the caller is that timer's task
    fn take_auto_flush(&self, id: &str) {
        if let Some(queue) = self.lock().get_mut(id) {
            queue.auto_flush = None;
        }
    }

    async fn execute(inner: Arc<Self>, id: String, options: Option<FlushOptions>) {
        if inner.is_disposed() {
            log::warn!("BatchManager is disposed; not executing batch '{}'", id);
            return;
        }

        let (operations, options) = {
            let mut queues = inner.lock();
            let Some(queue) = queues.get_mut(&id) else {
                log::debug!("Batch '{}' has nothing queued", id);
                return;
            };
            if queue.is_running() {
                log::warn!("Batch '{}' is already executing; ignoring flush", id);
                return;
            }
            if let Some(handle) = queue.auto_flush.take() {
                inner.timers.clear(handle);
            }
            queue.state = BatchState::Running;
            let options = options.unwrap_or_else(|| FlushOptions::from(&queue.config));
            (std::mem::take(&mut queue.operations), options)
        };
        inner.running.fetch_add(1, Ordering::AcqRel);
        let _guard = RunGuard {
            inner: Arc::clone(&inner),
            id: id.clone(),
        };

        let (operations, dropped) = plan_run(operations, options);
        if dropped > 0 {
            log::warn!(
                "Batch '{}' exceeds max size; dropping {} operations",
                id,
                dropped
            );
        }

        let total = operations.len();
        let mut failed = 0u64;
        for (index, queued) in operations.into_iter().enumerate() {
            let QueuedOperation { operation, .. } = queued;
            match tokio::spawn(async move { operation().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    failed += 1;
                    log::error!(
                        "Batch '{}': operation {}/{} failed: {}",
                        id,
                        index + 1,
                        total,
                        error
                    );
                }
                Err(join_error) => {
                    failed += 1;
                    log::error!(
                        "Batch '{}': operation {}/{} panicked: {}",
                        id,
                        index + 1,
                        total,
                        join_error
                    );
                }
            }
        }

        inner
            .counters
            .record_run(total as u64, failed, dropped as u64);
        log::debug!(
            "Batch '{}' executed {} operations ({} failed)",
            id,
            total,
            failed
        );
    }

    fn finish_run(self: &Arc<Self>, id: &str) {
        {
            let mut queues = self.lock();
            let deferred = queues.get(id).map_or(0, |queue| queue.operations.len());
            if deferred == 0 {
                queues.remove(id);
            } else if let Some(queue) = queues.get_mut(id) {
                queue.state = BatchState::Idle;
                log::debug!(
                    "Batch '{}' kept {} operations enqueued during the run",
                    id,
                    deferred
                );
                if queue.config.auto_execute && !self.is_disposed() {
                    self.schedule_auto_flush(id, queue);
                }
            }
        }
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no flush is running or `deadline` passes
    async fn wait_idle(&self, deadline: Instant) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running.load(Ordering::Acquire) == 0 {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    log::debug!("Idle wait timed out; running deferred operation");
                    return;
                }
            }
        }
    }
}

/// Scheduler for named batches of deferred operations
#[derive(Clone)]
pub struct BatchManager {
    inner: Arc<BatchInner>,
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("batches", &self.inner.lock().len())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl BatchManager {
    /// `config` supplies the defaults for batches created without options
    pub fn new(config: BatchConfig) -> LifecycleResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BatchInner {
                config,
                queues: Mutex::new(HashMap::new()),
                timers: TimerManager::new("batch-manager"),
                counters: BatchCounters::default(),
                running: AtomicUsize::new(0),
                idle: Notify::new(),
                anonymous: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Create or reset the batch `id`, discarding anything still queued.
    ///
    /// Returns `Ok(false)` without touching the queue when the batch is
    /// executing or the manager is disposed.
    pub fn start_batch(&self, id: &str, config: Option<BatchConfig>) -> LifecycleResult<bool> {
        let config = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => self.inner.config.clone(),
        };
        if self.inner.is_disposed() {
            log::warn!("BatchManager is disposed; ignoring start_batch('{}')", id);
            return Ok(false);
        }

        let discarded = {
            let mut queues = self.inner.lock();
            if queues.get(id).is_some_and(BatchQueue::is_running) {
                log::warn!("Batch '{}' is executing; start_batch rejected", id);
                return Ok(false);
            }
            let mut queue = BatchQueue::new(config);
            if queue.config.auto_execute {
                self.inner.schedule_auto_flush(id, &mut queue);
            }
            let previous = queues.insert(id.to_string(), queue);
            previous.map(|mut old| {
                if let Some(handle) = old.auto_flush.take() {
                    self.inner.timers.clear(handle);
                }
                std::mem::take(&mut old.operations)
            })
        };

        if let Some(discarded) = discarded.filter(|ops| !ops.is_empty()) {
            log::debug!(
                "Batch '{}' restarted, discarding {} queued operations",
                id,
                discarded.len()
            );
            self.inner.counters.record_cancelled(discarded.len() as u64);
        }
        Ok(true)
    }

    /// Queue `operation` under `id`, creating the batch with default options
    /// if needed. Returns false if the manager is disposed.
    pub fn add_operation<F, Fut>(&self, id: &str, operation: F, priority: i32) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        self.add_boxed(id, boxed(operation), priority)
    }

    pub fn add_boxed(&self, id: &str, operation: BoxedOperation, priority: i32) -> bool {
        if self.inner.is_disposed() {
            log::warn!("BatchManager is disposed; dropping operation for '{}'", id);
            return false;
        }

        let mut queues = self.inner.lock();
        let queue = match queues.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let queue = entry.insert(BatchQueue::new(self.inner.config.clone()));
                if queue.config.auto_execute {
                    self.inner.schedule_auto_flush(id, queue);
                }
                queue
            }
        };
        queue.operations.push(QueuedOperation {
            operation,
            priority,
            enqueued_at: Instant::now(),
        });
        true
    }

    /// Flush `id` with the options it was started with
    pub fn execute_batch(&self, id: &str) -> impl Future<Output = ()> + Send + 'static {
        BatchInner::execute(Arc::clone(&self.inner), id.to_string(), None)
    }

    /// Flush `id` with explicit ordering and size limits for this run
    pub fn execute_batch_with(
        &self,
        id: &str,
        options: FlushOptions,
    ) -> impl Future<Output = ()> + Send + 'static {
        BatchInner::execute(Arc::clone(&self.inner), id.to_string(), Some(options))
    }

    /// Drop the queued operations of `id` and its pending auto-flush. An
    /// operation already executing is not interrupted.
    pub fn cancel_batch(&self, id: &str) -> bool {
        let discarded = {
            let mut queues = self.inner.lock();
            let Some(queue) = queues.get_mut(id) else {
                return false;
            };
            if let Some(handle) = queue.auto_flush.take() {
                self.inner.timers.clear(handle);
            }
            let discarded = std::mem::take(&mut queue.operations);
            if !queue.is_running() {
                queues.remove(id);
            }
            discarded
        };
        self.inner.counters.record_cancelled(discarded.len() as u64);
        log::debug!(
            "Batch '{}' cancelled, {} operations discarded",
            id,
            discarded.len()
        );
        true
    }

    /// Run `operation` once no flush is in progress, or after `timeout`,
    /// whichever comes first
    pub fn auto_batch<F, Fut>(&self, operation: F, timeout: Duration) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let deadline = Instant::now() + timeout;
        self.inner.timers.spawn_task(async move {
            if let Some(inner) = weak.upgrade() {
                inner.wait_idle(deadline).await;
            }
            let failed = match tokio::spawn(async move { operation().await }).await {
                Ok(Ok(())) => false,
                Ok(Err(error)) => {
                    log::error!("Deferred operation failed: {}", error);
                    true
                }
                Err(join_error) => {
                    log::error!("Deferred operation panicked: {}", join_error);
                    true
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.counters.record_single(failed);
            }
        })
    }

    /// Enqueue `operations` as an anonymous batch and flush it immediately
    pub async fn batch_execute(&self, operations: Vec<BoxedOperation>) {
        if self.inner.is_disposed() {
            log::warn!("BatchManager is disposed; dropping anonymous batch");
            return;
        }
        let id = format!(
            "__anonymous_{}",
            self.inner.anonymous.fetch_add(1, Ordering::Relaxed)
        );
        {
            let mut queue = BatchQueue::new(BatchConfig {
                auto_execute: false,
                ..self.inner.config.clone()
            });
            let now = Instant::now();
            queue
                .operations
                .extend(operations.into_iter().map(|operation| QueuedOperation {
                    operation,
                    priority: 0,
                    enqueued_at: now,
                }));
            self.inner.lock().insert(id.clone(), queue);
        }
        BatchInner::execute(Arc::clone(&self.inner), id, None).await;
    }

    pub fn has_batch(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn pending(&self, id: &str) -> usize {
        self.inner
            .lock()
            .get(id)
            .map_or(0, |queue| queue.operations.len())
    }

    pub fn state(&self, id: &str) -> Option<BatchState> {
        self.inner.lock().get(id).map(|queue| queue.state)
    }

    /// Counters plus the state of one batch, or of every batch for `None`
    pub fn get_stats(&self, id: Option<&str>) -> BatchStats {
        let now = Instant::now();
        let mut batches: Vec<BatchInfo> = self
            .inner
            .lock()
            .iter()
            .filter(|(batch_id, _)| id.is_none_or(|wanted| wanted == batch_id.as_str()))
            .map(|(batch_id, queue)| BatchInfo {
                id: batch_id.clone(),
                state: queue.state,
                pending: queue.operations.len(),
                auto_flush_scheduled: queue.auto_flush.is_some(),
                age: now.saturating_duration_since(queue.created_at),
                oldest_pending: queue
                    .oldest_enqueue()
                    .map(|at| now.saturating_duration_since(at)),
            })
            .collect();
        batches.sort_by(|a, b| a.id.cmp(&b.id));
        self.inner.counters.snapshot(batches)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Cancel every pending auto-flush and deferred operation and drop all
    /// queues. A flush already in progress finishes its snapshot. Safe to
    /// call repeatedly.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.dispose();
        let queues: Vec<BatchQueue> = self.inner.lock().drain().map(|(_, queue)| queue).collect();
        let discarded: usize = queues.iter().map(|queue| queue.operations.len()).sum();
        self.inner.counters.record_cancelled(discarded as u64);
        log::debug!(
            "BatchManager disposed, dropped {} batches with {} pending operations",
            queues.len(),
            discarded
        );
    }
}
