//! Daemon settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use mailledger_remote::AccountId;
use mailledger_sync::EngineConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the settings file location.
pub const CONFIG_ENV: &str = "MAILLEDGER_SYNCD_CONFIG";

/// Settings read from `config.json`. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Engine tuning.
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Base URL of the mailbox service.
    pub remote_base_url: String,
    /// Bearer token for the mailbox service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Accounts to keep synced.
    pub accounts: Vec<AccountId>,
    /// How often to probe connectivity, in milliseconds.
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            remote_base_url: "http://127.0.0.1:8080/".to_string(),
            api_token: None,
            accounts: Vec::new(),
            probe_interval: Duration::from_secs(30),
        }
    }
}

impl DaemonSettings {
    /// Settings file location: `$MAILLEDGER_SYNCD_CONFIG`, else the user
    /// config directory.
    #[must_use]
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(
            || {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mailledger-syncd")
                    .join("config.json")
            },
            PathBuf::from,
        )
    }

    /// Load settings from a file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }
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
