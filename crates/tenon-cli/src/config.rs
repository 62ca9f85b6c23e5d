//! Settings file parsing (tenon.toml)
//!
//! ```toml
//! [listen]
//! addr = "0.0.0.0:8080"
//!
//! [server]
//! request_timeout = 10000
//!
//! [executor]
//! workers = 4
//! policy = "work-stealing"
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenon_core::{ExecutorConfig, QueuePolicy};
use tenon_web::config::millis;
use tenon_web::ServerConfig;
use thiserror::Error;

/// Errors that can occur while loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the settings file
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values that parse but cannot be used
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Everything the `serve` command needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listening socket
    pub listen: ListenSettings,
    /// Per-connection limits and timeouts
    pub server: ServerConfig,
    /// Worker pool
    pub executor: ExecutorSettings,
}

/// `[listen]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Address to bind
    pub addr: SocketAddr,
    /// How long one accept attempt waits before re-checking for shutdown
    #[serde(with = "millis")]
    pub accept_wait: Duration,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            accept_wait: Duration::from_millis(100),
        }
    }
}

/// Ready queue policy as written in the settings file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicySetting {
    #[default]
    Fifo,
    WorkStealing,
}

impl From<PolicySetting> for QueuePolicy {
    fn from(policy: PolicySetting) -> Self {
        match policy {
            PolicySetting::Fifo => QueuePolicy::Fifo,
            PolicySetting::WorkStealing => QueuePolicy::WorkStealing,
        }
    }
}

/// `[executor]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Worker threads; omitted means one per CPU
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Upper bound on `workers`
    pub max_workers: usize,
    /// `fifo` or `work-stealing`
    pub policy: PolicySetting,
    /// Poll for I/O and timers on a dedicated thread
    pub dedicated_poller: bool,
    /// Longest an idle worker sleeps before re-checking
    #[serde(with = "millis")]
    pub idle_wait: Duration,
    /// Resumes between non-blocking I/O polls on a busy worker
    pub event_interval: u32,
    /// How long shutdown waits for workers
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            workers: defaults.workers,
            max_workers: defaults.max_workers,
            policy: PolicySetting::Fifo,
            dedicated_poller: defaults.dedicated_poller,
            idle_wait: defaults.idle_wait,
            event_interval: defaults.event_interval,
            drain_timeout: defaults.drain_timeout,
        }
    }
}

impl ExecutorSettings {
    /// Executor configuration these settings describe
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            workers: self.workers,
            max_workers: self.max_workers,
            policy: self.policy.into(),
            dedicated_poller: self.dedicated_poller,
            idle_wait: self.idle_wait,
            event_interval: self.event_interval,
            drain_timeout: self.drain_timeout,
        }
    }
}

impl Settings {
    /// Load settings from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse settings from a string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "server.read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if server.max_header_size < 16 {
            return Err(ConfigError::Invalid(format!(
                "server.max_header_size is {}; a request line alone needs more",
                server.max_header_size
            )));
        }
        if server.request_timeout.is_zero() || server.keep_alive_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "server timeouts must be greater than 0".to_string(),
            ));
        }

        let executor = &self.executor;
        if executor.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_workers must be greater than 0".to_string(),
            ));
        }
        if executor.event_interval == 0 {
            return Err(ConfigError::Invalid(
                "executor.event_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
