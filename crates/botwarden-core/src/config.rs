//! Centralized configuration for Botwarden.
//!
//! Design constants live on unit structs so they read the same way at every
//! call site. [`SupervisorSettings`] carries the runtime values, loaded from
//! the environment and adjusted with builder methods.

use crate::error::{Result, WardenError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port probing and release timing.
pub struct PortConfig;

impl PortConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
    pub const FREE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Grace period between SIGTERM and SIGKILL when freeing a port.
    pub const KILL_GRACE_MS: u64 = 2000;
}

/// Readiness polling against the primary server's health endpoint.
pub struct ReadinessConfig;

impl ReadinessConfig {
    pub const MAX_ATTEMPTS: u32 = 30;
    pub const INTERVAL: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
    pub const STATUS_PATH: &'static str = "/status";
    /// Field whose presence in the health body means a model is loaded.
    pub const READY_MARKER: &'static str = "model_file";
}

/// Controller lifecycle values.
pub struct ControllerConfig;

impl ControllerConfig {
    pub const DEFAULT_PRIMARY_PORT: u16 = 5005;
    pub const AUXILIARY_PORT: u16 = 5055;
    pub const RESTART_SETTLE: Duration = Duration::from_millis(1000);
    pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ARTIFACT_SUFFIX: &'static str = ".tar.gz";
    pub const DEFAULT_PYTHON: &'static str = "python";
}

/// Message relay values.
pub struct RelayConfig;

impl RelayConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const WEBHOOK_PATH: &'static str = "/webhooks/rest/webhook";
}

/// Log sink values.
pub struct LogConfig;

impl LogConfig {
    pub const MEMORY_CAPACITY: usize = 1000;
    pub const FILE_PREFIX: &'static str = "log_";
    pub const LOGS_DIR_NAME: &'static str = "log";
    /// Host server logs: `server-YYYY-MM-DD.log`, dated in UTC.
    pub const GENERAL_FILE_PREFIX: &'static str = "server-";
    pub const GENERAL_FILE_EXTENSION: &'static str = ".log";
    pub const GENERAL_LOGS_DIR_NAME: &'static str = "logs";
}

/// Runtime settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Port the primary server binds.
    pub primary_port: u16,
    /// Port the auxiliary action server binds.
    pub auxiliary_port: u16,
    /// Base URL of the primary server (health and webhook requests).
    pub health_base_url: String,
    /// Directory holding trained model artifacts.
    pub artifact_dir: PathBuf,
    /// File name suffix an artifact must carry.
    pub artifact_suffix: String,
    /// Assistant project directory (cwd and PYTHONPATH of the action server).
    pub project_dir: PathBuf,
    /// Python interpreter used to run both servers.
    pub python: String,
    /// Endpoints file handed to the primary server.
    pub endpoints_file: PathBuf,
    /// Directory for daily log files.
    pub log_dir: PathBuf,
    /// Directory of the host server's own daily logs.
    pub general_log_dir: PathBuf,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub readiness_request_timeout: Duration,
    pub port_free_timeout: Duration,
    pub port_poll_interval: Duration,
    pub restart_settle: Duration,
    pub status_timeout: Duration,
}

impl SupervisorSettings {
    /// Create settings rooted at an assistant project directory.
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let port = ControllerConfig::DEFAULT_PRIMARY_PORT;

        Self {
            primary_port: port,
            auxiliary_port: ControllerConfig::AUXILIARY_PORT,
            health_base_url: format!("http://localhost:{}", port),
            artifact_dir: project_dir.join("models"),
            artifact_suffix: ControllerConfig::ARTIFACT_SUFFIX.to_string(),
            endpoints_file: project_dir.join("endpoints.yml"),
            log_dir: project_dir.join(LogConfig::LOGS_DIR_NAME),
            general_log_dir: PathBuf::from(LogConfig::GENERAL_LOGS_DIR_NAME),
            project_dir,
            python: ControllerConfig::DEFAULT_PYTHON.to_string(),
            readiness_attempts: ReadinessConfig::MAX_ATTEMPTS,
            readiness_interval: ReadinessConfig::INTERVAL,
            readiness_request_timeout: ReadinessConfig::REQUEST_TIMEOUT,
            port_free_timeout: PortConfig::FREE_TIMEOUT,
            port_poll_interval: PortConfig::POLL_INTERVAL,
            restart_settle: ControllerConfig::RESTART_SETTLE,
            status_timeout: ControllerConfig::STATUS_TIMEOUT,
        }
    }

    /// Load settings from the process environment.
    ///
    /// Recognized variables: `RASA_PROJECT_DIR`, `RASA_PORT`, `RASA_URL`,
    /// `RASA_MODELS_DIR`, `RASA_PYTHON`, `LOG_TODAY_DIR`, `LOG_DIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = lookup("RASA_PROJECT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("Rasa"));
        let mut settings = Self::new(project_dir);

        if let Some(raw) = lookup("RASA_PORT") {
            let port = raw.trim().parse::<u16>().map_err(|e| WardenError::Config {
                message: format!("invalid RASA_PORT '{}': {}", raw, e),
            })?;
            settings = settings.with_primary_port(port);
        }

        if let Some(url) = lookup("RASA_URL") {
            settings = settings.with_health_base_url(url)?;
        }

        if let Some(dir) = lookup("RASA_MODELS_DIR") {
            settings.artifact_dir = PathBuf::from(dir);
        }

        if let Some(python) = lookup("RASA_PYTHON") {
            settings.python = python;
        }

        if let Some(dir) = lookup("LOG_TODAY_DIR") {
            settings.log_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("LOG_DIR") {
            settings.general_log_dir = PathBuf::from(dir);
        }

        Ok(settings)
    }

    /// Set the primary port.
    ///
    /// The health URL follows the port unless it was set explicitly to a
    /// different host.
    pub fn with_primary_port(mut self, port: u16) -> Self {
        let default_url = format!("http://localhost:{}", self.primary_port);
        if self.health_base_url == default_url {
            self.health_base_url = format!("http://localhost:{}", port);
        }
        self.primary_port = port;
        self
    }

    /// Set the auxiliary port.
    pub fn with_auxiliary_port(mut self, port: u16) -> Self {
        self.auxiliary_port = port;
        self
    }

    /// Set the health base URL, validating its scheme.
    pub fn with_health_base_url(mut self, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        validate_http_url(&url)?;
        self.health_base_url = url.trim_end_matches('/').to_string();
        Ok(self)
    }

    /// Set the artifact directory.
    pub fn with_artifact_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.artifact_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the log directory.
    pub fn with_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the host server's log directory.
    pub fn with_general_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.general_log_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the readiness polling budget.
    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.readiness_attempts = attempts;
        self.readiness_interval = interval;
        self
    }

    /// Set how long to wait for a port to become free, and how often to probe.
    pub fn with_port_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.port_free_timeout = timeout;
        self.port_poll_interval = interval;
        self
    }

    /// Set the delay between stop and start during a restart.
    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        format!("{}{}", self.health_base_url, ReadinessConfig::STATUS_PATH)
    }

    /// Full URL of the message webhook.
    pub fn webhook_url(&self) -> String {
        format!("{}{}", self.health_base_url, RelayConfig::WEBHOOK_PATH)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::new("Rasa")
    }
}

fn validate_http_url(raw: &str) -> Result<()> {
    match url::Url::parse(raw) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(WardenError::Config {
                message: format!(
                    "invalid URL '{}': scheme must be http or https, got '{}'",
                    raw, scheme
                ),
            }),
        },
        Err(e) => Err(WardenError::Config {
            message: format!("invalid URL '{}': {}", raw, e),
        }),
    }
}
