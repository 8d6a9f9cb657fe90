//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What the search index covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Subject, sender, snippet and date only.
    #[default]
    Metadata,
    /// Metadata plus full body text, indexed when a body is fetched.
    FullBody,
}

/// Backoff settings for remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for the doubled delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Settings for [`Engine`](crate::Engine).
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// Messages per remote page and per cached page.
    pub page_size: u32,
    /// Lifetime of an in-memory cached page.
    #[serde(with = "duration_ms")]
    pub memory_cache_ttl: Duration,
    /// Pages kept in memory per account.
    pub memory_cache_capacity: usize,
    /// Timeout for a request to another unit.
    #[serde(with = "duration_ms")]
    pub unit_timeout: Duration,
    /// Timeout for a single remote call.
    #[serde(with = "duration_ms")]
    pub remote_timeout: Duration,
    /// Retry policy for remote calls.
    pub retry: RetryConfig,
    /// Background sync period for watched accounts.
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,
    /// Search index coverage.
    pub index_mode: IndexMode,
    /// Outbox targets replayed in parallel.
    pub drain_concurrency: usize,
    /// Payload storage quota in bytes.
    pub quota_bytes: u64,
    /// Usage fraction that starts an eviction pass.
    pub high_watermark: f64,
    /// Usage fraction an eviction pass frees down to.
    pub low_watermark: f64,
    /// Period of the eviction check.
    #[serde(with = "duration_ms")]
    pub eviction_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            page_size: 50,
            memory_cache_ttl: Duration::from_secs(30),
            memory_cache_capacity: 64,
            unit_timeout: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_interval: Duration::from_secs(120),
            index_mode: IndexMode::Metadata,
            drain_concurrency: 4,
            quota_bytes: 256 * 1024 * 1024,
            high_watermark: 0.9,
            low_watermark: 0.75,
            eviction_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Check that the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be positive".into()));
        }
        if self.memory_cache_capacity == 0 {
            return Err(Error::Config("memory_cache_capacity must be positive".into()));
        }
        if self.drain_concurrency == 0 {
            return Err(Error::Config("drain_concurrency must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be positive".into()));
        }
        if !(0.0 < self.low_watermark
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(Error::Config(
                "watermarks must satisfy 0 < low_watermark < high_watermark <= 1".into(),
            ));
        }
        Ok(())
    }

    /// Timeout for long-running orchestrator tasks (multi-page syncs).
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        self.remote_timeout
            .saturating_mul(self.retry.max_attempts.max(1))
            .saturating_add(self.unit_timeout)
            .saturating_mul(4)
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailledger-syncd")
        .join("sync.db")
}

/// Serde helpers for `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)] // Required by serde with= signature
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 50);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.index_mode, IndexMode::Metadata);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"page_size": 20, "sync_interval": 5000, "index_mode": "full_body"}"#,
        )
        .unwrap();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.index_mode, IndexMode::FullBody);
        assert_eq!(config.memory_cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let config = EngineConfig {
            high_watermark: 0.5,
            low_watermark: 0.8,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
