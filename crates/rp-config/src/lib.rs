//! Relaypoint router configuration
//!
//! Settings are read from a TOML file and can be overridden through
//! `RELAYPOINT_*` environment variables:
//!
//! ```toml
//! max_parallel_sends = 20
//! send_msg_retry_interval_ms = 3000
//! max_delay_with_exponential_backoff_ms = 60000
//! max_retry_count = 10
//! routing_table_cleanup_interval_ms = 60000
//! routing_table_grace_period_ms = 60000
//! access_control_enabled = false
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "RELAYPOINT_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tuning knobs of the message router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Number of concurrent send workers. One extra task runs routing-table housekeeping.
    pub max_parallel_sends: usize,
    /// First retry delay; doubled on every further retry.
    pub send_msg_retry_interval_ms: u64,
    /// Upper bound for any retry delay. Unbounded when unset.
    pub max_delay_with_exponential_backoff_ms: Option<u64>,
    /// Retries per recipient before a message is dropped. Unbounded (TTL only) when unset.
    pub max_retry_count: Option<u32>,
    pub routing_table_cleanup_interval_ms: u64,
    pub routing_table_grace_period_ms: u64,
    pub access_control_enabled: bool,
    /// How long shutdown waits for queued messages to drain.
    pub shutdown_drain_timeout_ms: u64,
    /// Key under which queued messages are persisted.
    pub message_queue_id: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_parallel_sends: 20,
            send_msg_retry_interval_ms: 3000,
            max_delay_with_exponential_backoff_ms: None,
            max_retry_count: None,
            routing_table_cleanup_interval_ms: 60_000,
            routing_table_grace_period_ms: 60_000,
            access_control_enabled: false,
            shutdown_drain_timeout_ms: 5_000,
            message_queue_id: "relaypoint-default".to_string(),
        }
    }
}

impl RouterSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: RouterSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: RouterSettings = toml::from_str(&content)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        info!(path = %path.display(), "Loaded router settings");
        Ok(settings)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> Result<Self> {
        let mut settings = RouterSettings::default();
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies overrides from `lookup`, which maps full variable names
    /// (e.g. `RELAYPOINT_MAX_PARALLEL_SENDS`) to values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "MAX_PARALLEL_SENDS")? {
            self.max_parallel_sends = v;
        }
        if let Some(v) = parse_var(&lookup, "SEND_MSG_RETRY_INTERVAL_MS")? {
            self.send_msg_retry_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_DELAY_WITH_EXPONENTIAL_BACKOFF_MS")? {
            self.max_delay_with_exponential_backoff_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "MAX_RETRY_COUNT")? {
            self.max_retry_count = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "ROUTING_TABLE_CLEANUP_INTERVAL_MS")? {
            self.routing_table_cleanup_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ROUTING_TABLE_GRACE_PERIOD_MS")? {
            self.routing_table_grace_period_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ACCESS_CONTROL_ENABLED")? {
            self.access_control_enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "SHUTDOWN_DRAIN_TIMEOUT_MS")? {
            self.shutdown_drain_timeout_ms = v;
        }
        if let Some(v) = lookup(&format!("{}MESSAGE_QUEUE_ID", ENV_PREFIX)) {
            self.message_queue_id = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_sends == 0 {
            return Err(ConfigError::Invalid("max_parallel_sends must be at least 1".to_string()));
        }
        if self.send_msg_retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("send_msg_retry_interval_ms must be positive".to_string()));
        }
        if let Some(cap) = self.max_delay_with_exponential_backoff_ms {
            if cap < self.send_msg_retry_interval_ms {
                return Err(ConfigError::Invalid(format!(
                    "max_delay_with_exponential_backoff_ms ({}) is below send_msg_retry_interval_ms ({})",
                    cap, self.send_msg_retry_interval_ms
                )));
            }
        }
        if self.routing_table_cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid("routing_table_cleanup_interval_ms must be positive".to_string()));
        }
        if self.message_queue_id.is_empty() {
            return Err(ConfigError::Invalid("message_queue_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn routing_table_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.routing_table_cleanup_interval_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        Some(value) => {
            debug!(key = %key, value = %value, "Applying settings override");
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        }
        None => Ok(None),
    }
}
