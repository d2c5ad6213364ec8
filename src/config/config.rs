use crate::error::ConfigError;
use crate::events::{ServerId, ServerStatus, WatchTarget};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration loaded from a TOML file
///
/// Every section has defaults, so an empty file yields a usable configuration
/// with no servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tailing: TailingConfig,
    pub alerts: AlertsConfig,
    pub monitor: MonitorConfig,
    pub collaborators: CollaboratorsConfig,
    pub servers: Vec<ServerConfig>,
}

/// How files are followed and segmented
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TailingConfig {
    /// Poll interval used by servers that do not set their own
    pub default_poll_interval_ms: u64,
    /// Lines carried over from a flushed chunk into the next one
    pub overlap_lines: usize,
    /// Consecutive failed polls before a follower gives up on its file
    pub max_consecutive_misses: u32,
    /// Process existing file content instead of starting at end-of-file
    pub read_from_start: bool,
}

impl Default for TailingConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: 1000,
            overlap_lines: 20,
            max_consecutive_misses: 5,
            read_from_start: false,
        }
    }
}

/// Notification cooldown, backing store and mail transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    /// Global silence window after a notification
    pub cooldown_minutes: u64,
    /// Redis URL for the silence store; in-memory when unset
    pub redis_url: Option<String>,
    /// Upper bound on a single store round-trip
    pub store_timeout_seconds: u64,
    /// SMTP relay; alerts are only logged when unset
    pub smtp: Option<SmtpConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 60,
            redis_url: None,
            store_timeout_seconds: 5,
            smtp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    #[serde(default = "default_true")]
    pub starttls: bool,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_seconds: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_smtp_timeout() -> u64 {
    30
}

/// Periodic error threshold evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub window_hours: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 3600,
            window_hours: 24,
        }
    }
}

/// Endpoints of the analysis and recommendation services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollaboratorsConfig {
    pub analysis_url: String,
    pub recommendation_url: String,
    pub timeout_seconds: u64,
    /// How often the enrichment retry queue is drained
    pub retry_tick_seconds: u64,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            analysis_url: "http://localhost:8000/parse".to_string(),
            recommendation_url: "http://localhost:8000/hints".to_string(),
            timeout_seconds: 30,
            retry_tick_seconds: 5,
        }
    }
}

/// A monitored server and the files to follow on it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: ServerId,
    #[serde(default)]
    pub name: String,
    pub project_id: Option<u32>,
    /// Owner address for keyword and threshold alerts
    pub recipient: String,
    #[serde(default)]
    pub log_path: String,
    pub error_log_path: Option<String>,
    #[serde(default)]
    pub alert_keywords: Vec<String>,
    /// Error count per problem over the monitoring window; no alerting when unset
    pub error_threshold: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    /// Per-server override of the global cooldown
    pub cooldown_minutes: Option<u64>,
    #[serde(skip, default = "default_status")]
    pub status: ServerStatus,
}

fn default_status() -> ServerStatus {
    ServerStatus::Stopped
}

impl ServerConfig {
    /// Distinct, non-blank paths to follow: the log path, then the error-log path
    /// when it differs
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let log_path = self.log_path.trim();
        if !log_path.is_empty() {
            paths.push(PathBuf::from(log_path));
        }
        if let Some(error_path) = self.error_log_path.as_deref().map(str::trim) {
            if !error_path.is_empty() && error_path != log_path {
                paths.push(PathBuf::from(error_path));
            }
        }
        paths
    }

    /// Build the watch target for one of this server's paths
    pub fn watch_target(&self, path: PathBuf, default_poll: Duration) -> WatchTarget {
        WatchTarget {
            server_id: self.id,
            path,
            alert_keywords: self.alert_keywords.clone(),
            recipient: self.recipient.clone(),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default_poll),
        }
    }
}

impl Config {
    /// Load, override from the environment and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        info!(
            "Loaded configuration from {} with {} server(s)",
            path.display(),
            config.servers.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TAILSIGHT_*` overrides through the given variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TAILSIGHT_ANALYSIS_URL") {
            self.collaborators.analysis_url = url;
        }
        if let Some(url) = lookup("TAILSIGHT_RECOMMENDATION_URL") {
            self.collaborators.recommendation_url = url;
        }
        if let Some(url) = lookup("TAILSIGHT_REDIS_URL") {
            self.alerts.redis_url = Some(url);
        }
        if let Some(minutes) = lookup("TAILSIGHT_COOLDOWN_MINUTES") {
            match minutes.parse() {
                Ok(minutes) => self.alerts.cooldown_minutes = minutes,
                Err(_) => warn!(
                    "Ignoring TAILSIGHT_COOLDOWN_MINUTES={}: not a number",
                    minutes
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tailing.default_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tailing.default_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.tailing.max_consecutive_misses == 0 {
            return Err(ConfigError::ValidationError(
                "tailing.max_consecutive_misses must be greater than 0".to_string(),
            ));
        }
        if self.monitor.interval_seconds == 0 || self.monitor.window_hours == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.interval_seconds and monitor.window_hours must be greater than 0"
                    .to_string(),
            ));
        }
        if self.collaborators.analysis_url.trim().is_empty()
            || self.collaborators.recommendation_url.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "collaborator URLs must not be empty".to_string(),
            ));
        }
        if self.collaborators.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "collaborators.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate server id {}",
                    server.id
                )));
            }
            if server.poll_interval_ms == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "server {}: poll_interval_ms must be greater than 0",
                    server.id
                )));
            }
            if server.recipient.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "server {}: recipient must not be empty",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tailing.default_poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.alerts.cooldown_minutes * 60)
    }

    pub fn monitor_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.monitor.window_hours as i64)
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }
}
