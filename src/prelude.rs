//! Lifepool prelude - convenient imports for users

// Composition root
pub use crate::lifepool::{FacadeStats, ResourceFacade, ResourceFacadeBuilder};

// Components
pub use crate::cache::batch::{BatchManager, BatchStats, BoxedOperation, FlushOptions, boxed};
pub use crate::cache::coordinator::{Debouncer, MemoryPersistence, ThrottleOutcome, Throttler};
pub use crate::cache::lifecycle::{SubscriptionId, SubscriptionManager, TimerHandle, TimerManager};
pub use crate::cache::lru::{LruCache, LruStats};
pub use crate::cache::pool::{ObjectPool, PoolStats, TypePoolStats};
pub use crate::cache::registry::ResourceRegistry;

// Configuration
pub use crate::cache::config::{
    BatchConfig, ConfigError, FacadeConfig, LifecycleConfig, LruConfig, PoolConfig,
};

// Errors and shared enums
pub use crate::cache::traits::{
    BatchState, LifecycleError, LifecycleResult, OperationError, OperationResult, RecoveryHint,
    TimerKind,
};

// Traits users implement for their own types
pub use crate::traits::{CacheKey, CacheValue, PersistenceAdapter, Poolable};
