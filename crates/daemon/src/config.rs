//! Configuration management for the Tether daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::ServerOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr is not a valid socket address: {0}")]
    InvalidListenAddr(String),

    #[error("handshake_timeout_ms must be between 100 and 120000, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("reconnect_grace_secs must be between 1 and 86400, got {0}")]
    InvalidReconnectGrace(u64),

    #[error("reaper_interval_secs must be between 1 and 3600, got {0}")]
    InvalidReaperInterval(u64),

    #[error("keepalive interval_secs must be between 1 and 3600, got {0}")]
    InvalidKeepaliveInterval(u64),

    #[error("keepalive timeout_secs must be between 1 and 600, got {0}")]
    InvalidKeepaliveTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// Keepalive probing configuration.
    pub keepalive: KeepaliveConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Budget in milliseconds for establishment and for the handshake.
    pub handshake_timeout_ms: u64,

    /// How long in seconds a disconnected session waits for a reconnect.
    pub reconnect_grace_secs: u64,

    /// How often in seconds expired sessions are swept.
    pub reaper_interval_secs: u64,
}

/// Keepalive probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between keepalive probes on framed sockets.
    pub interval_secs: u64,

    /// Seconds of extra silence past the interval before a socket is
    /// declared dead.
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2567".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            reconnect_grace_secs: 300, // 5 minutes
            reaper_interval_secs: 30,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_LISTEN_ADDR: Override the listener bind address
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TETHER_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        let timeout = self.session.handshake_timeout_ms;
        if !(100..=120_000).contains(&timeout) {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }

        let grace = self.session.reconnect_grace_secs;
        if !(1..=86_400).contains(&grace) {
            return Err(ConfigError::InvalidReconnectGrace(grace));
        }

        let interval = self.session.reaper_interval_secs;
        if !(1..=3_600).contains(&interval) {
            return Err(ConfigError::InvalidReaperInterval(interval));
        }

        let ka_interval = self.keepalive.interval_secs;
        if !(1..=3_600).contains(&ka_interval) {
            return Err(ConfigError::InvalidKeepaliveInterval(ka_interval));
        }

        let ka_timeout = self.keepalive.timeout_secs;
        if !(1..=600).contains(&ka_timeout) {
            return Err(ConfigError::InvalidKeepaliveTimeout(ka_timeout));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Server tunables derived from this configuration.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions::default()
            .with_handshake_timeout(Duration::from_millis(self.session.handshake_timeout_ms))
            .with_reconnect_grace(Duration::from_secs(self.session.reconnect_grace_secs))
            .with_reaper_interval(Duration::from_secs(self.session.reaper_interval_secs))
            .with_keepalive(
                Duration::from_secs(self.keepalive.interval_secs),
                Duration::from_secs(self.keepalive.timeout_secs),
            )
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/tether/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.listen_addr, "127.0.0.1:2567");
        assert_eq!(config.session.handshake_timeout_ms, 10_000);
        assert_eq!(config.session.reconnect_grace_secs, 300);
        assert_eq!(config.session.reaper_interval_secs, 30);
        assert_eq!(config.keepalive.interval_secs, 30);
        assert_eq!(config.keepalive.timeout_secs, 10);
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
reconnect_grace_secs = 60
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.reconnect_grace_secs, 60);
        // Other values should be defaults
        assert_eq!(config.server.listen_addr, "127.0.0.1:2567");
        assert_eq!(config.session.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[server]
listen_addr = "0.0.0.0:9000"

[session]
handshake_timeout_ms = 5000
reconnect_grace_secs = 120
reaper_interval_secs = 10

[keepalive]
interval_secs = 15
timeout_secs = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.session.handshake_timeout_ms, 5000);
        assert_eq!(config.session.reconnect_grace_secs, 120);
        assert_eq!(config.session.reaper_interval_secs, 10);
        assert_eq!(config.keepalive.interval_secs, 15);
        assert_eq!(config.keepalive.timeout_secs, 5);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
reconnect_grace_secs = "not a number"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();

        // Should contain all sections
        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[keepalive]"));
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::default();
        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.server.listen_addr = "127.0.0.1:9999".to_string();
        original.session.reconnect_grace_secs = 42;
        original.keepalive.interval_secs = 7;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.reaper_interval_secs = 15;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir
            .path()
            .join("nested")
            .join("dirs")
            .join("config.toml");

        let config = Config::default();
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("tether"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        std::env::set_var("TETHER_LISTEN_ADDR", "0.0.0.0:7777");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.listen_addr, "0.0.0.0:7777");

        std::env::remove_var("TETHER_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TETHER_LISTEN_ADDR", "");

        let mut config = Config::default();
        let original_addr = config.server.listen_addr.clone();

        config.apply_env_overrides();

        assert_eq!(config.server.listen_addr, original_addr);

        std::env::remove_var("TETHER_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("TETHER_LISTEN_ADDR");
        std::env::remove_var("TETHER_LOG_LEVEL");

        let mut config = Config::default();
        let original = config.clone();

        config.apply_env_overrides();

        assert_eq!(config, original);
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("TETHER_LISTEN_ADDR");
        std::env::set_var("TETHER_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("TETHER_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_listen_addr() {
        let mut config = Config::default();
        config.server.listen_addr = "not an address".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("not an address".to_string()))
        );
    }

    #[test]
    fn test_validate_handshake_timeout_too_low() {
        let mut config = Config::default();
        config.session.handshake_timeout_ms = 50;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHandshakeTimeout(50))
        );
    }

    #[test]
    fn test_validate_handshake_timeout_too_high() {
        let mut config = Config::default();
        config.session.handshake_timeout_ms = 120_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHandshakeTimeout(120_001))
        );
    }

    #[test]
    fn test_validate_zero_reconnect_grace() {
        let mut config = Config::default();
        config.session.reconnect_grace_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReconnectGrace(0)));
    }

    #[test]
    fn test_validate_zero_reaper_interval() {
        let mut config = Config::default();
        config.session.reaper_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidReaperInterval(0))
        );
    }

    #[test]
    fn test_validate_zero_keepalive_interval() {
        let mut config = Config::default();
        config.keepalive.interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidKeepaliveInterval(0))
        );
    }

    #[test]
    fn test_validate_keepalive_timeout_too_high() {
        let mut config = Config::default();
        config.keepalive.timeout_secs = 601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidKeepaliveTimeout(601))
        );
    }

    #[test]
    fn test_validate_bad_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = Config::default();
        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_options_mapping() {
        let mut config = Config::default();
        config.session.handshake_timeout_ms = 2_500;
        config.session.reconnect_grace_secs = 90;
        config.session.reaper_interval_secs = 5;
        config.keepalive.interval_secs = 20;
        config.keepalive.timeout_secs = 6;

        let options = config.server_options();
        assert_eq!(options.handshake_timeout, Duration::from_millis(2_500));
        assert_eq!(options.reconnect_grace, Duration::from_secs(90));
        assert_eq!(options.reaper_interval, Duration::from_secs(5));
        assert_eq!(options.channel.keepalive_interval, Duration::from_secs(20));
        assert_eq!(options.channel.keepalive_timeout, Duration::from_secs(6));
    }
}
