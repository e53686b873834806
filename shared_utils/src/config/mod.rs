//! Configuration management module for tunneld.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the daemon and the client tooling.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(target_os = "macos")]
fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/tunneld/daemon.sock")
}

#[cfg(not(target_os = "macos"))]
fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/tunneld/daemon.sock")
}

#[cfg(target_os = "macos")]
fn default_settings_dir() -> PathBuf {
    PathBuf::from("/Library/Application Support/tunneld")
}

#[cfg(not(target_os = "macos"))]
fn default_settings_dir() -> PathBuf {
    PathBuf::from("/var/lib/tunneld")
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_socket_poll_attempts() -> u32 {
    25
}

fn default_socket_poll_initial_ms() -> u64 {
    10
}

fn default_socket_poll_max_ms() -> u64 {
    250
}

fn default_reconnect_interval_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Daemon configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Path of the Unix Domain Socket the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Directory holding the daemon's durable settings document
    #[serde(default = "default_settings_dir")]
    pub settings_dir: PathBuf,

    /// Grace period for in-flight connections on shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Maximum number of checks for the socket file after binding (default: 25)
    #[serde(default = "default_socket_poll_attempts")]
    pub socket_poll_attempts: u32,

    /// First delay between socket checks in milliseconds (default: 10)
    #[serde(default = "default_socket_poll_initial_ms")]
    pub socket_poll_initial_ms: u64,

    /// Upper bound on the delay between socket checks in milliseconds (default: 250)
    #[serde(default = "default_socket_poll_max_ms")]
    pub socket_poll_max_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            settings_dir: default_settings_dir(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            socket_poll_attempts: default_socket_poll_attempts(),
            socket_poll_initial_ms: default_socket_poll_initial_ms(),
            socket_poll_max_ms: default_socket_poll_max_ms(),
        }
    }
}

impl DaemonConfig {
    /// Returns the shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// A tunnel known to the client, as declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelEntry {
    /// Stable numeric identifier
    pub id: i32,

    /// Display name, also passed to the engine
    pub name: String,

    /// WireGuard quick-config text
    pub quick_config: String,

    /// Feature flags (e.g. "amnezia", "ipv6")
    #[serde(default)]
    pub features: Vec<String>,
}

/// Client-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Path of the daemon socket to connect to
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Override for the per-user secret file (default: ~/.tunneld/ipc.key)
    #[serde(default)]
    pub secret_path: Option<PathBuf>,

    /// Delay between status stream reconnect attempts in seconds (default: 3)
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Tunnels the client can start
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            secret_path: None,
            reconnect_interval_secs: default_reconnect_interval_secs(),
            tunnels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Returns the status stream reconnect interval as a [`Duration`].
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

/// Main configuration structure for tunneld.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            daemon: DaemonConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "daemon.socket_path",
                "socket path cannot be empty",
            ));
        }
        if self.daemon.settings_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "daemon.settings_dir",
                "settings directory cannot be empty",
            ));
        }
        if self.daemon.socket_poll_attempts == 0 {
            return Err(ConfigError::invalid(
                "daemon.socket_poll_attempts",
                "must be greater than 0",
            ));
        }
        if self.daemon.socket_poll_initial_ms > self.daemon.socket_poll_max_ms {
            return Err(ConfigError::invalid(
                "daemon.socket_poll_initial_ms",
                "must not exceed daemon.socket_poll_max_ms",
            ));
        }
        if self.client.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "client.socket_path",
                "socket path cannot be empty",
            ));
        }
        if self.client.reconnect_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "client.reconnect_interval_secs",
                "must be greater than 0",
            ));
        }

        let mut seen = HashSet::new();
        for tunnel in &self.client.tunnels {
            if tunnel.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "client.tunnels.name",
                    format!("tunnel {} has an empty name", tunnel.id),
                ));
            }
            if !seen.insert(tunnel.id) {
                return Err(ConfigError::invalid(
                    "client.tunnels.id",
                    format!("duplicate tunnel id {}", tunnel.id),
                ));
            }
        }

        Ok(())
    }

    /// Apply overrides (prefix: TUNNELD_) resolved through `lookup`.
    /// Keys:
    /// - TUNNELD_LOG_LEVEL
    /// - TUNNELD_DAEMON_SOCKET_PATH, TUNNELD_DAEMON_SETTINGS_DIR, TUNNELD_DAEMON_SHUTDOWN_GRACE_SECS
    /// - TUNNELD_CLIENT_SOCKET_PATH, TUNNELD_CLIENT_SECRET_PATH, TUNNELD_CLIENT_RECONNECT_INTERVAL_SECS
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("TUNNELD_LOG_LEVEL") {
            self.log_level = v;
        }

        // Daemon
        if let Some(v) = non_empty("TUNNELD_DAEMON_SOCKET_PATH") {
            self.daemon.socket_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("TUNNELD_DAEMON_SETTINGS_DIR") {
            self.daemon.settings_dir = PathBuf::from(v);
        }
        if let Some(n) = non_empty("TUNNELD_DAEMON_SHUTDOWN_GRACE_SECS").and_then(|v| v.parse().ok()) {
            self.daemon.shutdown_grace_secs = n;
        }

        // Client
        if let Some(v) = non_empty("TUNNELD_CLIENT_SOCKET_PATH") {
            self.client.socket_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("TUNNELD_CLIENT_SECRET_PATH") {
            self.client.secret_path = Some(PathBuf::from(v));
        }
        if let Some(n) =
            non_empty("TUNNELD_CLIENT_RECONNECT_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.client.reconnect_interval_secs = n;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tunneld").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}
