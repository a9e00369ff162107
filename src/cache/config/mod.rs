//! Configuration for caches, pools, batches and facades
//!
//! Every component validates its configuration at construction time.

pub mod types;

pub use types::{BatchConfig, ConfigError, FacadeConfig, LifecycleConfig, LruConfig, PoolConfig};
