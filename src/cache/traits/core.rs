//! Core traits implemented by cached and pooled types
//!
//! Keys and values only need blanket bounds; pooled types implement
//! `Poolable` so the pool can reinitialize them in place instead of
//! constructing new instances.

use std::fmt::Debug;
use std::hash::Hash;

use super::types_and_enums::LifecycleResult;

/// Cache key bounds
pub trait CacheKey: Clone + Send + Sync + Debug + Hash + Eq + 'static {}

impl<T> CacheKey for T where T: Clone + Send + Sync + Debug + Hash + Eq + 'static {}

/// Cache value bounds
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Reusable instance managed by an `ObjectPool`
///
/// The pool calls `create` on a checkout miss and `reset` when handing out an
/// idle instance, so both must leave the instance representing `id`.
pub trait Poolable: Send + 'static {
    /// Identity the instance represents while checked out
    type Id: Send;
    /// Extra construction arguments
    type Args: Send;

    /// Build a fresh instance for `id`
    fn create(id: Self::Id, args: Self::Args) -> Self;

    /// Reinitialize an idle instance to represent `id`
    fn reset(&mut self, id: Self::Id, args: Self::Args);

    /// Return the instance to its pristine default before it goes idle
    fn clear(&mut self);

    /// Pristine instance used to pre-populate the idle set
    fn pristine() -> Self;

    /// Release whatever the instance holds. Called exactly once when the pool
    /// decides not to keep the instance.
    fn teardown(&mut self) -> LifecycleResult<()> {
        Ok(())
    }
}
