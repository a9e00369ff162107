//! Error types and shared enumerations for the lifecycle subsystem
//!
//! `LifecycleError` is the canonical error for every component. Most runtime
//! failures are isolated and logged instead of returned, so the variants that
//! actually reach callers are configuration and persistence failures.

/// Recovery hint for lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry the operation later
    RetryBackoff,
    /// Fall back to an alternative source (e.g. bypass the cache)
    Fallback,
    /// Rebuild the component with a corrected configuration
    Reconfigure,
    /// The component is gone for good
    Fatal,
}

/// Canonical error type for the lifecycle subsystem
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleError {
    /// Invalid capacity, TTL or interval supplied at construction
    InvalidConfiguration(String),
    /// Operation attempted on a component that has been disposed
    Disposed(&'static str),
    /// Pooled instance could not be torn down cleanly
    TeardownFailed(String),
    /// A batched operation reported failure
    OperationFailed(String),
    /// Persistence adapter failure
    Persistence(String),
    /// Configuration file could not be loaded
    ConfigLoad(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            LifecycleError::Disposed(component) => write!(f, "{} has been disposed", component),
            LifecycleError::TeardownFailed(msg) => write!(f, "Teardown failed: {}", msg),
            LifecycleError::OperationFailed(msg) => write!(f, "Operation failed: {}", msg),
            LifecycleError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            LifecycleError::ConfigLoad(msg) => write!(f, "Failed to load configuration: {}", msg),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl LifecycleError {
    /// Create invalid configuration error
    #[inline(always)]
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create teardown error
    #[inline(always)]
    pub fn teardown_failed(msg: impl Into<String>) -> Self {
        Self::TeardownFailed(msg.into())
    }

    /// Create operation error
    #[inline(always)]
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create persistence error
    #[inline(always)]
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::InvalidConfiguration(_) | Self::ConfigLoad(_) => RecoveryHint::Reconfigure,
            Self::Disposed(_) => RecoveryHint::Fatal,
            Self::TeardownFailed(_) | Self::OperationFailed(_) => RecoveryHint::RetryBackoff,
            Self::Persistence(_) => RecoveryHint::Fallback,
        }
    }

    /// Check if operation can be retried
    pub fn retryable(&self) -> bool {
        matches!(
            self.recovery_hint(),
            RecoveryHint::RetryBackoff | RecoveryHint::Fallback
        )
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Error returned by a batched operation
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a batched operation
pub type OperationResult = Result<(), OperationError>;

/// Timer kind tracked by a `TimerManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires once, then removes itself from the tracking set
    Timeout,
    /// Fires every period until cleared
    Interval,
    /// Tracked future (auto-flush, idle callback)
    Task,
}

/// Execution state of a named batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
}
