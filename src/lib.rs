//! Lifepool - resource lifecycle and cache management
//!
//! Shared, time-bounded resources with deterministic cleanup.
//!
//! # Features
//!
//! - **LRU cache**: fixed capacity, O(1) access, per-entry TTL with lazy
//!   expiry and a background sweep
//! - **Object pool**: per-type idle sets, in-place reset on checkout, idle-time
//!   reclamation
//! - **Batch manager**: named batches with priority ordering, auto-flush and
//!   isolated operation failures
//! - **Timer and subscription managers**: tracked handles with idempotent bulk
//!   disposal
//! - **Resource facade**: one owner's cache, persistence, debounce and throttle
//!   behind a single cascading `dispose()`
//!
//! Deferred work runs on tokio; build facades and managers inside a runtime.

// Public API modules
pub mod lifepool;
pub mod prelude;

// Component modules - traits are public for user implementations
pub mod cache;

// Re-export the public API at the crate root for convenience
pub use lifepool::{FacadeStats, ResourceFacade, ResourceFacadeBuilder};
pub use prelude::*;

// Traits users implement for their own types
pub mod traits {
    pub use crate::cache::coordinator::PersistenceAdapter;
    pub use crate::cache::traits::{CacheKey, CacheValue, Poolable};
}
