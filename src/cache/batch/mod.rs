//! Coalesced execution of deferred operations

pub mod manager;
pub mod queue;
mod statistics;

pub use manager::BatchManager;
pub use queue::{BoxedOperation, FlushOptions, OperationFuture, boxed};
pub use statistics::{BatchInfo, BatchStats};
