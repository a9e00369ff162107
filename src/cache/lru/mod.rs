//! TTL-aware LRU cache

pub mod core;
mod entry;
mod statistics;

pub use self::core::LruCache;
pub use statistics::LruStats;
