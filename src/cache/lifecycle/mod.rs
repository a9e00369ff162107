//! Timer and subscription tracking
//!
//! Both managers guarantee deterministic cleanup: `dispose()` cancels every
//! tracked resource synchronously and later registrations degrade to no-ops.

pub mod subscription;
pub mod timer;

pub use subscription::{SubscriptionId, SubscriptionManager};
pub use timer::{TimerHandle, TimerManager};
