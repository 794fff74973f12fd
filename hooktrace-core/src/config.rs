//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/hooktrace/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/hooktrace/` (~/.config/hooktrace/)
//! - Data: `$XDG_DATA_HOME/hooktrace/` (~/.local/share/hooktrace/)
//! - State/Logs: `$XDG_STATE_HOME/hooktrace/` (~/.local/state/hooktrace/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Trace log storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// In-memory retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4317
}

/// Trace log storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory for per-run trace logs; defaults to the XDG data dir
    pub data_dir: Option<PathBuf>,

    /// Number of most recent run logs replayed at startup
    #[serde(default = "default_replay_runs")]
    pub replay_runs: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            replay_runs: default_replay_runs(),
        }
    }
}

fn default_replay_runs() -> usize {
    50
}

impl StorageConfig {
    /// Resolve the effective data directory.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Config::data_dir)
    }
}

/// In-memory retention configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Minutes a non-running run stays in memory before eviction
    #[serde(default = "default_run_ttl_minutes")]
    pub run_ttl_minutes: u32,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_ttl_minutes: default_run_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_run_ttl_minutes() -> u32 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl RetentionConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.run_ttl_minutes == 0 {
            return Err(Error::Config(
                "retention.run_ttl_minutes must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "retention.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also log to stdout (for foreground server runs)
    #[serde(default)]
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.retention.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/hooktrace/config.toml` (~/.config/hooktrace/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("hooktrace").join("config.toml")
    }

    /// Returns the data directory path (for per-run trace logs)
    ///
    /// `$XDG_DATA_HOME/hooktrace/` (~/.local/share/hooktrace/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("hooktrace")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/hooktrace/` (~/.local/state/hooktrace/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("hooktrace")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/hooktrace/hooktrace.log` (~/.local/state/hooktrace/hooktrace.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("hooktrace.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
