//! Queued operations and per-id batch state

use std::cmp::Reverse;
use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

use crate::cache::config::BatchConfig;
use crate::cache::lifecycle::TimerHandle;
use crate::cache::traits::{BatchState, OperationResult};

/// Future produced by a batched operation
pub type OperationFuture = Pin<Box<dyn Future<Output = OperationResult> + Send>>;

/// Deferred operation; nothing runs until the batch is flushed
pub type BoxedOperation = Box<dyn FnOnce() -> OperationFuture + Send>;

/// Box an async closure into a `BoxedOperation`
pub fn boxed<F, Fut>(operation: F) -> BoxedOperation
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    Box::new(move || Box::pin(operation()) as OperationFuture)
}

/// Per-run ordering and size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOptions {
    pub sort_by_priority: bool,
    pub max_batch_size: Option<usize>,
}

impl From<&BatchConfig> for FlushOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            sort_by_priority: config.sort_by_priority,
            max_batch_size: config.max_batch_size,
        }
    }
}

pub(crate) struct QueuedOperation {
    pub(crate) operation: BoxedOperation,
    pub(crate) priority: i32,
    pub(crate) enqueued_at: Instant,
}

pub(crate) struct BatchQueue {
    pub(crate) operations: Vec<QueuedOperation>,
    pub(crate) state: BatchState,
    pub(crate) config: BatchConfig,
    pub(crate) auto_flush: Option<TimerHandle>,
    pub(crate) created_at: Instant,
}

impl BatchQueue {
    pub(crate) fn new(config: BatchConfig) -> Self {
        Self {
            operations: Vec::new(),
            state: BatchState::Idle,
            config,
            auto_flush: None,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == BatchState::Running
    }

    pub(crate) fn oldest_enqueue(&self) -> Option<Instant> {
        self.operations.iter().map(|op| op.enqueued_at).min()
    }
}

/// Order a snapshot for one run. Sorting is stable so equal priorities keep
/// enqueue order. Returns the operations to run and how many were dropped by
/// the size limit.
pub(crate) fn plan_run(
    mut operations: Vec<QueuedOperation>,
    options: FlushOptions,
) -> (Vec<QueuedOperation>, usize) {
    if options.sort_by_priority {
        operations.sort_by_key(|op| Reverse(op.priority));
    }
    let dropped = match options.max_batch_size {
        Some(limit) if operations.len() > limit => {
            let dropped = operations.len() - limit;
            operations.truncate(limit);
            dropped
        }
        _ => 0,
    };
    (operations, dropped)
}
