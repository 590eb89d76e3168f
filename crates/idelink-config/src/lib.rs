#![deny(unsafe_code)]

//! Configuration loading and validation for idelink.
//!
//! Loads TOML configuration files describing which analysis daemon to
//! spawn, which project it serves, and how the controller logs. The
//! [`AppConfig`] type is the central configuration structure shared by the
//! CLI and the core library.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// How the analysis daemon is launched and torn down.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The project the daemon analyses.
    #[serde(default)]
    pub project: ProjectConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the spawned analysis daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path or name of the daemon executable.
    #[serde(default = "default_daemon_binary")]
    pub binary: PathBuf,

    /// Extra arguments passed to the daemon.
    #[serde(default)]
    pub args: Vec<String>,

    /// How long a graceful shutdown may take before the daemon is killed.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Whether requests issued before the handshake completes should wait
    /// for it instead of failing immediately.
    #[serde(default)]
    pub wait_for_init: bool,
}

impl DaemonConfig {
    /// The shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_daemon_binary(),
            args: Vec::new(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            wait_for_init: false,
        }
    }
}

fn default_daemon_binary() -> PathBuf {
    PathBuf::from("ide-daemon")
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Project served by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project root handed to the daemon during the handshake.
    #[serde(default = "default_project_root")]
    pub root: PathBuf,

    /// Saved-state snapshot to load instead of a full initial scan.
    #[serde(default)]
    pub saved_state_path: Option<PathBuf>,

    /// Enable ranked autocomplete in the daemon.
    #[serde(default)]
    pub ranked_autocomplete: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: default_project_root(),
            saved_state_path: None,
            ranked_autocomplete: false,
        }
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Number of telemetry events kept in memory.
    #[serde(default = "default_telemetry_buffer")]
    pub telemetry_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            telemetry_buffer: default_telemetry_buffer(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_telemetry_buffer() -> usize {
    256
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.binary.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.binary must not be empty".to_string(),
            ));
        }
        if !(1..=300).contains(&self.daemon.shutdown_timeout_secs) {
            return Err(ConfigError::Validation(format!(
                "daemon.shutdown_timeout_secs must be in 1..=300, got {}",
                self.daemon.shutdown_timeout_secs
            )));
        }
        if self.project.root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "project.root must not be empty".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        if self.logging.telemetry_buffer == 0 {
            return Err(ConfigError::Validation(
                "logging.telemetry_buffer must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
