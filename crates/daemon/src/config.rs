//! Configuration management for the Server Dash daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/server-dash/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use protocol::{Geometry, SESSION_COOKIE, TOKEN_TTL_SECS};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 0 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("bind_address must be a socket address like 127.0.0.1:3000, got {0}")]
    InvalidBindAddress(String),

    #[error("ws_path must start with '/', got {0}")]
    InvalidWsPath(String),

    #[error("max_message_size must be greater than 0, got {0}")]
    InvalidMaxMessageSize(usize),

    #[error("handshake_timeout_secs must be greater than 0, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("kill_signal is not a known signal: {0}")]
    InvalidKillSignal(String),

    #[error("token_ttl_secs must be greater than 0, got {0}")]
    InvalidTokenTtl(u64),

    #[error("cookie_name must not be empty")]
    EmptyCookieName,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("token secret environment variable {0} is not set")]
    MissingSecret(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `max_sessions`.
const MAX_SESSIONS_LIMIT: usize = 1000;

/// Main configuration structure for the Server Dash daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Terminal socket listener configuration.
    pub server: ServerConfig,

    /// Shell session configuration.
    pub session: SessionConfig,

    /// Token verification settings.
    pub auth: AuthConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (audit log).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,

    /// Write terminal events to the audit log.
    pub audit_log: bool,

    /// Audit log location (default: `<data_dir>/audit.log`).
    pub audit_path: Option<PathBuf>,
}

/// Terminal socket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_address: String,

    /// Request path accepted for terminal upgrades.
    pub ws_path: String,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,

    /// Seconds allowed for the WebSocket upgrade to complete.
    pub handshake_timeout_secs: u64,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn for new sessions.
    pub default_shell: String,

    /// Value of `TERM` in the shell environment.
    pub term: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Shell working directory (default: home directory).
    pub working_dir: Option<PathBuf>,

    /// Maximum number of concurrent sessions (0 = unlimited).
    pub max_sessions: usize,

    /// Close sessions with no traffic for this many seconds (0 = never).
    pub idle_timeout_secs: u64,

    /// Signal sent to the shell when a session closes.
    pub kill_signal: String,

    /// Seconds to wait after `kill_signal` before sending SIGKILL (0 = never escalate).
    pub kill_grace_secs: u64,
}

/// Token verification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the cookie carrying the session token.
    pub cookie_name: String,

    /// Environment variable holding the token signing secret.
    pub secret_env: String,

    /// Lifetime of tokens issued by the `token` command.
    pub token_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
            audit_log: true,
            audit_path: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            ws_path: "/terminal".to_string(),
            max_message_size: 1024 * 1024, // 1MB
            handshake_timeout_secs: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let geometry = Geometry::default();
        Self {
            default_shell: default_shell(),
            term: "xterm-color".to_string(),
            cols: geometry.cols,
            rows: geometry.rows,
            working_dir: None,
            max_sessions: 0,
            idle_timeout_secs: 0,
            kill_signal: "SIGHUP".to_string(),
            kill_grace_secs: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: SESSION_COOKIE.to_string(),
            secret_env: "JWT_SECRET".to_string(),
            token_ttl_secs: TOKEN_TTL_SECS,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("server-dash")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("server-dash")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Resolve a shell to an executable path.
///
/// Absolute paths must exist; bare names are looked up on `PATH`.
pub fn resolve_shell(shell: &str) -> Option<PathBuf> {
    let path = Path::new(shell);
    if path.is_absolute() {
        path.exists().then(|| path.to_path_buf())
    } else {
        which::which(shell).ok()
    }
}

/// Parse a signal given by name (with or without `SIG`) or number.
pub fn parse_signal(signal_str: &str) -> Result<Signal, ConfigError> {
    let invalid = || ConfigError::InvalidKillSignal(signal_str.to_string());

    // Handle numeric signals
    if let Ok(num) = signal_str.trim().parse::<i32>() {
        if num > 0 && num < 32 {
            return Signal::try_from(num).map_err(|_| invalid());
        }
        return Err(invalid());
    }

    // Handle named signals (with or without SIG prefix)
    let name = signal_str.trim().to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    match name {
        "HUP" => Ok(Signal::SIGHUP),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "TERM" => Ok(Signal::SIGTERM),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        _ => Err(invalid()),
    }
}

impl DaemonConfig {
    /// Effective audit log path, or `None` when auditing is disabled.
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if !self.audit_log {
            return None;
        }
        Some(
            self.audit_path
                .clone()
                .unwrap_or_else(|| self.data_dir.join("audit.log")),
        )
    }
}

impl ServerConfig {
    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl SessionConfig {
    /// Initial terminal geometry.
    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        Geometry::new(self.cols, self.rows).ok_or(ConfigError::InvalidGeometry {
            cols: self.cols,
            rows: self.rows,
        })
    }

    /// Working directory for spawned shells.
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Grace period before SIGKILL escalation, if enabled.
    pub fn kill_grace(&self) -> Option<Duration> {
        (self.kill_grace_secs > 0).then(|| Duration::from_secs(self.kill_grace_secs))
    }

    /// Signal sent on session close.
    pub fn kill_signal(&self) -> Result<Signal, ConfigError> {
        parse_signal(&self.kill_signal)
    }

    /// Session limit, if enabled.
    pub fn session_limit(&self) -> Option<usize> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }
}

impl AuthConfig {
    /// Read the token secret from the configured environment variable.
    pub fn load_secret(&self) -> Result<String, ConfigError> {
        match std::env::var(&self.secret_env) {
            Ok(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(ConfigError::MissingSecret(self.secret_env.clone())),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SERVER_DASH_BIND: Override the listener address
    /// - SERVER_DASH_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SERVER_DASH_SHELL: Override the shell spawned for sessions
    ///
    /// Returns the overridden fields and their new values. Nothing is logged
    /// here because overrides are applied before tracing is installed.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Ok(bind) = std::env::var("SERVER_DASH_BIND") {
            if !bind.is_empty() {
                applied.push(("bind_address", bind.clone()));
                self.server.bind_address = bind;
            }
        }

        if let Ok(level) = std::env::var("SERVER_DASH_LOG_LEVEL") {
            if !level.is_empty() {
                applied.push(("log_level", level.clone()));
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("SERVER_DASH_SHELL") {
            if !shell.is_empty() {
                applied.push(("default_shell", shell.clone()));
                self.session.default_shell = shell;
            }
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        self.session.geometry()?;

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath(self.server.ws_path.clone()));
        }

        if self.server.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize(
                self.server.max_message_size,
            ));
        }

        if self.server.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidHandshakeTimeout(
                self.server.handshake_timeout_secs,
            ));
        }

        if resolve_shell(&self.session.default_shell).is_none() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        self.session.kill_signal()?;

        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidTokenTtl(self.auth.token_ttl_secs));
        }

        if self.auth.cookie_name.trim().is_empty() {
            return Err(ConfigError::EmptyCookieName);
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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
