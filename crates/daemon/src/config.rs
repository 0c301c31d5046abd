//! Configuration management for the PodTerm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/podterm/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::RegistrySettings;

/// Default address the HTTP/WebSocket server binds to.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Largest accepted `session.max_sessions`.
pub const MAX_SESSIONS_LIMIT: usize = 10_000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("bind_addr must be a socket address like 127.0.0.1:8080, got {0}")]
    InvalidBindAddr(String),

    #[error("idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("eviction_interval_secs must be greater than 0")]
    InvalidEvictionInterval,

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("backend program must not be empty")]
    EmptyProgram,

    #[error("initial terminal size must be non-zero, got {0}x{1}")]
    InvalidGeometry(u16, u16),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the PodTerm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP/WebSocket server configuration.
    pub server: ServerConfig,

    /// Session registry configuration.
    pub session: SessionConfig,

    /// Remote process backend configuration.
    pub backend: BackendConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log to a daily rolling file at this path instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions not accessed for this long are evicted.
    pub idle_timeout_secs: u64,

    /// How often the eviction sweep runs.
    pub eviction_interval_secs: u64,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

/// How the backend runs its command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Under a pseudo-terminal.
    #[default]
    Pty,
    /// With plain pipes; stderr stays separate.
    Pipe,
}

/// Remote process backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Launch mode.
    pub mode: BackendMode,

    /// Program to run per session.
    pub program: String,

    /// Arguments; `{namespace}` and `{pod}` are substituted.
    pub args: Vec<String>,

    /// Extra environment variables as `[name, value]` pairs.
    pub env: Vec<(String, String)>,

    /// Initial terminal width.
    pub initial_cols: u16,

    /// Initial terminal height.
    pub initial_rows: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60 * 60,
            eviction_interval_secs: 30,
            max_sessions: 100,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Pty,
            program: "kubectl".to_string(),
            args: ["exec", "-i", "-t", "-n", "{namespace}", "{pod}", "--", "/bin/sh"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: Vec::new(),
            initial_cols: 80,
            initial_rows: 24,
        }
    }
}

impl SessionConfig {
    /// Idle window as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a duration.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podterm")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PODTERM_BIND_ADDR: Override the server bind address
    /// - PODTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PODTERM_IDLE_TIMEOUT_SECS: Override the session idle timeout
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PODTERM_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("PODTERM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(secs) = std::env::var("PODTERM_IDLE_TIMEOUT_SECS") {
            if !secs.is_empty() {
                match secs.parse::<u64>() {
                    Ok(secs) => {
                        tracing::info!("Overriding idle_timeout_secs from environment: {}", secs);
                        self.session.idle_timeout_secs = secs;
                    }
                    Err(e) => {
                        tracing::warn!("Ignoring invalid PODTERM_IDLE_TIMEOUT_SECS {:?}: {}", secs, e);
                    }
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }

        if self.session.eviction_interval_secs == 0 {
            return Err(ConfigError::InvalidEvictionInterval);
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.backend.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }

        if self.backend.initial_cols == 0 || self.backend.initial_rows == 0 {
            return Err(ConfigError::InvalidGeometry(
                self.backend.initial_cols,
                self.backend.initial_rows,
            ));
        }

        Ok(())
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_addr))
    }

    /// Registry tunables derived from the session and backend sections.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            idle_timeout: self.session.idle_timeout(),
            max_sessions: self.session.max_sessions,
            initial_cols: self.backend.initial_cols,
            initial_rows: self.backend.initial_rows,
            ..RegistrySettings::default()
        }
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
