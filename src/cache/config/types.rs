//! Configuration types for every lifecycle component
//!
//! All durations are stored as milliseconds so the structs serialize cleanly
//! to TOML and JSON. Each struct validates itself; constructors call
//! `validate()` so an invalid capacity or TTL fails fast.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::traits::LifecycleError;

/// LRU cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruConfig {
    /// Maximum number of live entries
    pub max_size: usize,
    /// TTL applied when `set` is called without one (None = no expiry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl_ms: Option<u64>,
    /// Period of the background expiry sweep
    pub sweep_interval_ms: u64,
    /// Run the background expiry sweep
    pub enable_gc: bool,
}

/// Object pool configuration (applies per pooled type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle instances retained per type
    pub max_size: usize,
    /// Idle instances older than this are torn down by the sweep
    pub max_idle_time_ms: u64,
    /// Run the idle sweep (period = max_idle_time / 2)
    pub enable_gc: bool,
}

/// Batch manager defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Schedule a flush when a batch is started
    pub auto_execute: bool,
    /// Delay before the scheduled flush
    pub auto_execute_delay_ms: u64,
    /// Run higher priorities first
    pub sort_by_priority: bool,
    /// Operations beyond this count are dropped from a flush
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
}

/// Per-owner facade configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Logical owner; also the batch id used for write-behind
    pub owner_id: String,
    /// Debounce delay before coalesced writes are persisted
    pub persist_delay_ms: u64,
    /// Window for throttled change notifications
    pub notify_interval_ms: u64,
    /// Cache keys with an explicit TTL, enumerated up front
    pub key_ttls_ms: BTreeMap<String, u64>,
}

/// Aggregated configuration, loadable from a TOML or JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub cache: LruConfig,
    pub pool: PoolConfig,
    pub batch: BatchConfig,
    pub facade: FacadeConfig,
}

/// Configuration error types
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    FileNotFound(String),
    FileReadError(String),
    TomlParseError(String),
    JsonParseError(String),
    UnsupportedFormat(String),
    InvalidFieldValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Configuration file not found: {}", path),
            ConfigError::FileReadError(msg) => {
                write!(f, "Failed to read configuration file: {}", msg)
            }
            ConfigError::TomlParseError(msg) => write!(f, "TOML parsing error: {}", msg),
            ConfigError::JsonParseError(msg) => write!(f, "JSON parsing error: {}", msg),
            ConfigError::UnsupportedFormat(ext) => write!(f, "Unsupported file format: {}", ext),
            ConfigError::InvalidFieldValue {
                field,
                value,
                reason,
            } => write!(
                f,
                "Invalid value '{}' for field '{}': {}",
                value, field, reason
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for LifecycleError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::InvalidFieldValue { .. } => {
                LifecycleError::InvalidConfiguration(error.to_string())
            }
            other => LifecycleError::ConfigLoad(other.to_string()),
        }
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidFieldValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_ms: None,
            sweep_interval_ms: 60_000, // 1 minute
            enable_gc: true,
        }
    }
}

impl LruConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(invalid("cache.max_size", self.max_size, "must be at least 1"));
        }
        if self.default_ttl_ms == Some(0) {
            return Err(invalid("cache.default_ttl_ms", 0, "must be greater than zero"));
        }
        if self.enable_gc && self.sweep_interval_ms == 0 {
            return Err(invalid(
                "cache.sweep_interval_ms",
                0,
                "must be greater than zero when enable_gc is set",
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_idle_time_ms: 300_000, // 5 minutes
            enable_gc: true,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(invalid("pool.max_size", self.max_size, "must be at least 1"));
        }
        if self.max_idle_time_ms < 2 {
            return Err(invalid(
                "pool.max_idle_time_ms",
                self.max_idle_time_ms,
                "must be at least 2ms so the sweep period is non-zero",
            ));
        }
        Ok(())
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Idle sweep period: half the idle threshold
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms / 2)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            auto_execute: false,
            auto_execute_delay_ms: 16,
            sort_by_priority: false,
            max_batch_size: None,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == Some(0) {
            return Err(invalid("batch.max_batch_size", 0, "must be at least 1"));
        }
        Ok(())
    }

    pub fn auto_execute_delay(&self) -> Duration {
        Duration::from_millis(self.auto_execute_delay_ms)
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            owner_id: "default".to_string(),
            persist_delay_ms: 100,
            notify_interval_ms: 50,
            key_ttls_ms: BTreeMap::new(),
        }
    }
}

impl FacadeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_id.is_empty() {
            return Err(invalid("facade.owner_id", "", "must not be empty"));
        }
        if let Some((key, _)) = self.key_ttls_ms.iter().find(|(_, ttl)| **ttl == 0) {
            return Err(invalid(
                &format!("facade.key_ttls_ms.{}", key),
                0,
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn persist_delay(&self) -> Duration {
        Duration::from_millis(self.persist_delay_ms)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    /// Explicit TTL for `key`, if one was enumerated
    pub fn ttl_for(&self, key: &str) -> Option<Duration> {
        self.key_ttls_ms.get(key).copied().map(Duration::from_millis)
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.pool.validate()?;
        self.batch.validate()?;
        self.facade.validate()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::TomlParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConfigError::JsonParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, choosing the format by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            Some(other) => Err(ConfigError::UnsupportedFormat(other.to_string())),
            None => Err(ConfigError::UnsupportedFormat(String::new())),
        }
    }

    /// Serialize to TOML, e.g. to write out a default configuration file
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::TomlParseError(e.to_string()))
    }
}
