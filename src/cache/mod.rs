//! Resource lifecycle and cache management
//!
//! Leaf components (timers, subscriptions, LRU cache) are independent; the
//! object pool and batch manager build on the timer manager, and the
//! coordinator helpers build on both for the facade.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod lifecycle;
pub mod lru;
pub mod pool;
pub mod registry;
pub mod traits;
