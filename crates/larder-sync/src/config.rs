//! Sync layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Validation limits
const MAX_FETCH_RETRIES: u32 = 10;
const MIN_FEED_CHANNEL_CAPACITY: usize = 16;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning for fetches, retries and the change feed.
///
/// # Examples
///
/// ```rust
/// use larder_sync::SyncConfig;
///
/// let config = SyncConfig::builder()
///     .stale_time_ms(10_000)
///     .fetch_retries(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.fetch_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long fetched data counts as fresh.
    pub stale_time_ms: u64,

    /// Extra attempts for a failed read. Mutations are never retried.
    pub fetch_retries: u32,

    /// First wait between fetch retries.
    pub retry_initial_interval_ms: u64,

    /// Upper bound on the wait between fetch retries.
    pub retry_max_interval_ms: u64,

    /// Buffered events per change-feed subscription before listeners lag.
    pub feed_channel_capacity: usize,

    /// Write the correlation id into inserted records and suppress feed
    /// events that echo an in-flight mutation's id.
    ///
    /// Only enable when the remote store returns the field in change events.
    pub echo_correlation_ids: bool,

    /// Record field carrying the echoed correlation id.
    pub correlation_field: String,

    /// Field stamped with the actor id on inserts, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_field: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            fetch_retries: 3,
            retry_initial_interval_ms: 500,
            retry_max_interval_ms: 5_000,
            feed_channel_capacity: 1024,
            echo_correlation_ids: false,
            correlation_field: "client_mutation_id".to_string(),
            owner_field: Some("user_id".to_string()),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }

    /// Check the configuration for values the sync layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_time_ms == 0 {
            return Err(ConfigError::Invalid("stale_time_ms must be greater than 0".into()));
        }
        if self.fetch_retries > MAX_FETCH_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "fetch_retries must be at most {}",
                MAX_FETCH_RETRIES
            )));
        }
        if self.retry_initial_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry_initial_interval_ms must be greater than 0".into(),
            ));
        }
        if self.retry_max_interval_ms < self.retry_initial_interval_ms {
            return Err(ConfigError::Invalid(
                "retry_max_interval_ms must not be below retry_initial_interval_ms".into(),
            ));
        }
        if self.feed_channel_capacity < MIN_FEED_CHANNEL_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "feed_channel_capacity must be at least {}",
                MIN_FEED_CHANNEL_CAPACITY
            )));
        }
        if self.correlation_field.trim().is_empty() {
            return Err(ConfigError::Invalid("correlation_field must not be empty".into()));
        }
        if self.owner_field.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(ConfigError::Invalid("owner_field must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_time_ms(mut self, ms: u64) -> Self {
        self.config.stale_time_ms = ms;
        self
    }

    pub fn fetch_retries(mut self, retries: u32) -> Self {
        self.config.fetch_retries = retries;
        self
    }

    pub fn retry_interval_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.retry_initial_interval_ms = initial;
        self.config.retry_max_interval_ms = max;
        self
    }

    pub fn feed_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.feed_channel_capacity = capacity;
        self
    }

    pub fn echo_correlation_ids(mut self, enabled: bool) -> Self {
        self.config.echo_correlation_ids = enabled;
        self
    }

    pub fn correlation_field(mut self, field: impl Into<String>) -> Self {
        self.config.correlation_field = field.into();
        self
    }

    pub fn owner_field(mut self, field: Option<String>) -> Self {
        self.config.owner_field = field;
        self
    }

    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
