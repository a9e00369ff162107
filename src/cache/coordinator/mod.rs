//! Coordination helpers used by the facade: debounce, throttle and the
//! persistence seam

pub mod debounce;
pub mod persistence;
pub mod throttle;

pub use debounce::Debouncer;
pub use persistence::{MemoryPersistence, PersistenceAdapter};
pub use throttle::{ThrottleOutcome, Throttler};
