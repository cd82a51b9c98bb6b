//! Configuration system for connhub.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CONNHUB_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/connhub/config.toml
//!   3. ~/.config/connhub/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub connect: ConnectConfig,
    pub correlation: CorrelationConfig,
    pub ping: PingConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// How long a `connect()` on an address that is already connecting waits
    /// for that attempt to settle.
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Extra correlation attempts for an outbound session whose `connect()`
    /// registration has not landed yet.
    pub retries: u32,
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Run a keepalive probe on sessions we initiated.
    pub enabled: bool,
    /// Max wait for a pong.
    pub timeout_secs: u64,
    /// Pause between probe cycles.
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Lifecycle events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub snapshot_capacity: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 60,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            retries: 4,
            retry_interval_ms: 200,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 5 * 60,
            interval_secs: 5 * 60,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            snapshot_capacity: 64,
        }
    }
}

impl ConnectConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl CorrelationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl PingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("connhub")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HubConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HubConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CONNHUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply CONNHUB_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONNHUB_CONNECT__WAIT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.connect.wait_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CONNHUB_PING__ENABLED") {
            self.ping.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CONNHUB_PING__TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.ping.timeout_secs = secs;
            }
        }
    }
}
