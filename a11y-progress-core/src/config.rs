//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/a11y-progress/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/a11y-progress/` (~/.config/a11y-progress/)
//! - Data: `$XDG_DATA_HOME/a11y-progress/` (~/.local/share/a11y-progress/)
//! - State/Logs: `$XDG_STATE_HOME/a11y-progress/` (~/.local/state/a11y-progress/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "a11y-progress";

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
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Backend server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Progress channel (WebSocket) settings
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Reducer limits and cleanup thresholds
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the analysis backend (e.g., `http://localhost:8000`)
    #[serde(default = "default_server_url")]
    pub url: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient REST failures
    #[serde(default = "default_server_max_retries")]
    pub max_retries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            timeout_secs: default_server_timeout(),
            max_retries: default_server_max_retries(),
        }
    }
}

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_server_timeout() -> u64 {
    30
}

fn default_server_max_retries() -> usize {
    3
}

/// Progress channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Fixed delay before each reconnect attempt
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Reconnect attempts allowed before the connection gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Seconds without any inbound frame before the session is considered dead (0 disables)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            liveness_timeout_secs: default_liveness_timeout(),
        }
    }
}

fn default_reconnect_delay() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_liveness_timeout() -> u64 {
    90
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Returns None when the liveness check is disabled
    pub fn liveness_timeout(&self) -> Option<Duration> {
        (self.liveness_timeout_secs > 0).then(|| Duration::from_secs(self.liveness_timeout_secs))
    }
}

/// Reducer limits and periodic cleanup thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    /// Capacity of the recent-updates list
    #[serde(default = "default_recent_updates")]
    pub recent_updates: usize,

    /// Capacity of the completed-agents list
    #[serde(default = "default_completed")]
    pub completed: usize,

    /// Capacity of the errored-agents list
    #[serde(default = "default_errored")]
    pub errored: usize,

    /// Updates accumulated since the last clear before a forced clear
    #[serde(default = "default_cleanup_max_updates")]
    pub cleanup_max_updates: u64,

    /// Completions accumulated since the last clear before a forced clear
    #[serde(default = "default_cleanup_max_completed")]
    pub cleanup_max_completed: u64,

    /// Seconds between cleanup checks (0 disables)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            recent_updates: default_recent_updates(),
            completed: default_completed(),
            errored: default_errored(),
            cleanup_max_updates: default_cleanup_max_updates(),
            cleanup_max_completed: default_cleanup_max_completed(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_recent_updates() -> usize {
    20
}

fn default_completed() -> usize {
    10
}

fn default_errored() -> usize {
    5
}

fn default_cleanup_max_updates() -> u64 {
    200
}

fn default_cleanup_max_completed() -> u64 {
    50
}

fn default_cleanup_interval() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning an error describing the first problem
    pub fn validate(&self) -> Result<()> {
        let url = self.server.url.trim();
        if url.is_empty() {
            return Err(Error::Config("server.url must not be empty".to_string()));
        }
        if !(url.starts_with("http://")
            || url.starts_with("https://")
            || url.starts_with("ws://")
            || url.starts_with("wss://"))
        {
            return Err(Error::Config(format!(
                "server.url must use http, https, ws or wss: {}",
                url
            )));
        }
        if self.progress.recent_updates == 0
            || self.progress.completed == 0
            || self.progress.errored == 0
        {
            return Err(Error::Config(
                "progress list capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/a11y-progress/config.toml` (~/.config/a11y-progress/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (for persisted preferences)
    ///
    /// `$XDG_DATA_HOME/a11y-progress/` (~/.local/share/a11y-progress/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/a11y-progress/` (~/.local/state/a11y-progress/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the preferences file path
    pub fn preferences_path() -> PathBuf {
        Self::data_dir().join("preferences.json")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/a11y-progress/a11y-progress.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("a11y-progress.log")
    }

    /// WebSocket address of the progress stream for a job
    ///
    /// `http://host:8000` becomes `ws://host:8000/api/progress?upload_id=<id>`.
    pub fn progress_url(&self, upload_id: &str) -> String {
        let base = self.server.url.trim().trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!(
            "{}/api/progress?upload_id={}",
            ws_base,
            urlencoding::encode(upload_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.url, "http://localhost:8000");
        assert_eq!(config.channel.reconnect_delay_ms, 3000);
        assert_eq!(config.channel.max_reconnect_attempts, 5);
        assert_eq!(config.progress.recent_updates, 20);
        assert_eq!(config.progress.completed, 10);
        assert_eq!(config.progress.errored, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
url = "https://a11y.example.com"

[channel]
reconnect_delay_ms = 500
max_reconnect_attempts = 2
liveness_timeout_secs = 0

[progress]
recent_updates = 40

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.url, "https://a11y.example.com");
        assert_eq!(config.channel.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(config.channel.max_reconnect_attempts, 2);
        assert!(config.channel.liveness_timeout().is_none());
        assert_eq!(config.progress.recent_updates, 40);
        assert_eq!(config.progress.completed, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.progress.errored = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_progress_url() {
        let mut config = Config::default();
        assert_eq!(
            config.progress_url("abc-123"),
            "ws://localhost:8000/api/progress?upload_id=abc-123"
        );

        config.server.url = "https://a11y.example.com/".to_string();
        assert_eq!(
            config.progress_url("job 1"),
            "wss://a11y.example.com/api/progress?upload_id=job%201"
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[channel]\nmax_reconnect_attempts = 7\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.channel.max_reconnect_attempts, 7);

        std::fs::write(&path, "[progress]\ncompleted = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
