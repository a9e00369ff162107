//! Object pool with per-type idle sets and idle-time reclamation

mod bucket;
pub mod manager;
mod statistics;

pub use manager::ObjectPool;
pub use statistics::{PoolStats, TypePoolStats};
