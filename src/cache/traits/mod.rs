//! Traits and shared types for cached and pooled resources

pub mod core;
pub mod types_and_enums;

pub use self::core::{CacheKey, CacheValue, Poolable};
pub use types_and_enums::{
    BatchState, LifecycleError, LifecycleResult, OperationError, OperationResult, RecoveryHint,
    TimerKind,
};
