//! Configuration management for the Codoc conversation engine.
//!
//! The engine and its front ends share one configuration file at `~/.codoc/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CODOC_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `CODOC_API_BASE_URL` → api.base_url
//! - `CODOC_ACCESS_TOKEN` → api.access_token
//! - `CODOC_FLUSH_INTERVAL_MS` → chat.flush_interval_ms
//! - `CODOC_LOG_LEVEL` → observability.log_level
//! - `CODOC_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".codoc"),
        |dirs| dirs.home_dir().join(".codoc"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// API Configuration
// ============================================================================

/// Backend API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the learning backend. A trailing `/` is ignored.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout for ordinary JSON requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout. The event stream has no read timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bearer token attached to every request when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            access_token: None,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// Chat Configuration
// ============================================================================

/// Streaming conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Debounce interval for coalesced token flushes (about one frame).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Maximum draft length in characters.
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    /// Capacity of the reader-to-driver event channel of each stream.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            max_input_length: default_max_input_length(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ChatConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    ///
    /// With `path` set the file must exist; otherwise the default path is
    /// used and a missing file falls back to defaults.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CODOC_API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = lookup("CODOC_ACCESS_TOKEN") {
            self.api.access_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(interval) = lookup("CODOC_FLUSH_INTERVAL_MS") {
            match interval.parse() {
                Ok(ms) => self.chat.flush_interval_ms = ms,
                Err(_) => tracing::warn!(value = %interval, "Ignoring invalid CODOC_FLUSH_INTERVAL_MS"),
            }
        }
        if let Some(level) = lookup("CODOC_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("CODOC_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Load and validate configuration.
    pub fn load_and_validate(path: Option<&Path>) -> Result<Self> {
        let config = Self::load_with_env(path)?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

// Default value functions
fn default_base_url() -> String {
    "http://127.0.0.1:8080".into()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_flush_interval() -> u64 {
    16
}
fn default_max_input_length() -> usize {
    500
}
fn default_event_channel_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
