//! Runtime configuration of the sync core.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Slow tier: periodic re-attempts of permanently failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRetryConfig {
    /// Auto-retry runs an item may take part in before only the user can retry it.
    pub max_attempts: u32,
    /// Time between runs.
    pub interval: Duration,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    /// Local store file; `None` resolves to the OS data directory.
    pub db_path: Option<PathBuf>,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub drain_interval: Duration,
    pub status_poll_interval: Duration,
    pub worker_retry: RetryPolicy,
    pub auto_retry: AutoRetryConfig,
    pub lease_ttl: Duration,
    /// In-flight items older than this at startup are assumed abandoned.
    pub stale_in_flight_after: Duration,
    pub media_quota_bytes: u64,
    pub failed_display_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            api_token: None,
            db_path: None,
            probe_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            drain_interval: Duration::from_secs(30),
            status_poll_interval: Duration::from_secs(5),
            worker_retry: RetryPolicy::default(),
            auto_retry: AutoRetryConfig::default(),
            lease_ttl: Duration::from_secs(120),
            stale_in_flight_after: Duration::from_secs(120),
            media_quota_bytes: 256 * 1024 * 1024,
            failed_display_limit: 50,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

impl SyncConfig {
    /// Defaults overridden by `FIELDOPS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("FIELDOPS_API_URL") {
            config.api_url = url;
        }
        config.api_token = lookup("FIELDOPS_API_TOKEN").filter(|t| !t.is_empty());
        config.db_path = lookup("FIELDOPS_DB_PATH").map(PathBuf::from);

        if let Some(secs) = parse_var(&lookup, "FIELDOPS_DRAIN_INTERVAL_SECS")? {
            config.drain_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var(&lookup, "FIELDOPS_MAX_RETRIES")? {
            config.worker_retry.max_retries = max;
        }
        if let Some(max) = parse_var(&lookup, "FIELDOPS_AUTO_RETRY_MAX_ATTEMPTS")? {
            config.auto_retry.max_attempts = max;
        }
        if let Some(secs) = parse_var(&lookup, "FIELDOPS_AUTO_RETRY_INTERVAL_SECS")? {
            config.auto_retry.interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var(&lookup, "FIELDOPS_MEDIA_QUOTA_BYTES")? {
            config.media_quota_bytes = bytes;
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_worker_retry(mut self, policy: RetryPolicy) -> Self {
        self.worker_retry = policy;
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: AutoRetryConfig) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_media_quota_bytes(mut self, bytes: u64) -> Self {
        self.media_quota_bytes = bytes;
        self
    }

    pub fn with_failed_display_limit(mut self, limit: usize) -> Self {
        self.failed_display_limit = limit;
        self
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => {
            let parsed = value.trim().parse();
            parsed
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { var, value })
        }
    }
}
