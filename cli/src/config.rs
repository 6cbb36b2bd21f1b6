// Configuration location and editing for uwbpair
//
// The pairing configuration lives in:
// - macOS: ~/Library/Application Support/uwbpair/config.json
// - Linux: ~/.config/uwbpair/config.json
// - Windows: %APPDATA%\uwbpair\config.json
//
// `--config <path>` overrides the location for every subcommand.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uwb_pairing_core::PairingConfig;

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("uwbpair");
    Ok(dir)
}

/// Config file to use, honouring an explicit override
pub fn config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("config.json")),
    }
}

/// Load config from file, falling back to defaults when it does not exist
pub fn load(path: &Path) -> Result<PairingConfig> {
    if !path.exists() {
        return Ok(PairingConfig::default());
    }
    PairingConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Config for startup: a broken file falls back to defaults, and the load
/// error comes back so it can be reported
pub fn load_or_default(path: &Path) -> (PairingConfig, Option<anyhow::Error>) {
    match load(path) {
        Ok(config) => (config, None),
        Err(e) => (PairingConfig::default(), Some(e)),
    }
}

/// Save config, creating the parent directory
pub fn save(config: &PairingConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    config
        .save(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))
}

/// Set a config value by key
pub fn set(config: &mut PairingConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "tunnel_timeout_ms" => {
            config.secure_channel.tunnel_timeout_ms =
                value.parse().context("Invalid number")?;
        }
        "retry_delay_ms" => {
            config.secure_channel.retry_delay_ms = value.parse().context("Invalid number")?;
        }
        "escalate_tunnel_timeout" => {
            config.secure_channel.escalate_tunnel_timeout =
                value.parse().context("Invalid boolean value")?;
        }
        "log_level" => config.logging.level = value.to_string(),
        "log_json" => {
            config.logging.json = value.parse().context("Invalid boolean value")?;
        }
        "log_file" => {
            config.logging.file = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        "profile" => config.session.profile = value.to_string(),
        "mailbox_capacity" => {
            config.session.mailbox_capacity = value.parse().context("Invalid number")?;
        }
        "max_sessions" => {
            config.session.max_sessions = value.parse().context("Invalid number")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    config.validate().context("Value rejected")?;
    Ok(())
}

/// Get a config value by key
pub fn get(config: &PairingConfig, key: &str) -> Option<String> {
    list(config)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// List all config values
pub fn list(config: &PairingConfig) -> Vec<(String, String)> {
    let secure = &config.secure_channel;
    vec![
        ("tunnel_timeout_ms".to_string(), secure.tunnel_timeout_ms.to_string()),
        ("retry_delay_ms".to_string(), secure.retry_delay_ms.to_string()),
        (
            "escalate_tunnel_timeout".to_string(),
            secure.escalate_tunnel_timeout.to_string(),
        ),
        ("log_level".to_string(), config.logging.level.clone()),
        ("log_json".to_string(), config.logging.json.to_string()),
        (
            "log_file".to_string(),
            config
                .logging
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(stderr)".to_string()),
        ),
        ("profile".to_string(), config.session.profile.clone()),
        (
            "mailbox_capacity".to_string(),
            config.session.mailbox_capacity.to_string(),
        ),
        ("max_sessions".to_string(), config.session.max_sessions.to_string()),
    ]
}
