//! Pairing configuration
//!
//! Plain values, JSON on disk, validated on load and save. Durations are
//! stored in milliseconds.

use crate::secure::driver::{DEFAULT_RETRY_DELAY, DEFAULT_TUNNEL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureChannelConfig {
    /// Wait for a tunnelled reply before the timer fires
    pub tunnel_timeout_ms: u64,

    /// Delay before re-asking for session data the peer does not have yet
    pub retry_delay_ms: u64,

    /// Abort the session when a tunnelled reply times out
    pub escalate_tunnel_timeout: bool,
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self {
            tunnel_timeout_ms: DEFAULT_TUNNEL_TIMEOUT.as_millis() as u64,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            escalate_tunnel_timeout: false,
        }
    }
}

impl SecureChannelConfig {
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,

    /// Emit JSON lines instead of the human-readable format
    pub json: bool,

    /// Log file for the CLI; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Role profile name, see `RoleProfile::by_name`
    pub profile: String,

    /// Bound of each session actor's mailbox
    pub mailbox_capacity: usize,

    /// Concurrent sessions allowed in one registry
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            profile: "pacs-controller".to_string(),
            mailbox_capacity: 64,
            max_sessions: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub secure_channel: SecureChannelConfig,
    pub logging: LoggingConfig,
    pub session: SessionSettings,
}

impl PairingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secure_channel.tunnel_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "tunnel_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.secure_channel.retry_delay_ms >= self.secure_channel.tunnel_timeout_ms {
            return Err(ConfigError::Invalid(
                "retry_delay_ms must be shorter than tunnel_timeout_ms".to_string(),
            ));
        }

        if self.session.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }

        if self.session.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".to_string(),
            ));
        }

        if self.session.profile.trim().is_empty() {
            return Err(ConfigError::Invalid("profile must be named".to_string()));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging level must be set".to_string()));
        }

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_string(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn from_json_string(json: &str) -> Result<Self, ConfigError> {
        let config: PairingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.secure_channel.tunnel_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.secure_channel.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_escalated_timeouts(mut self, escalate: bool) -> Self {
        self.secure_channel.escalate_tunnel_timeout = escalate;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.session.profile = profile.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.logging.json = json;
        self
    }
}
