//! Error types for Botwarden.
//!
//! Every controller operation converts its failures into a [`WardenError`]
//! at the operation boundary. Nothing here is allowed to bring down the
//! host process; the HTTP layer maps each variant onto a status code.

use crate::process::Role;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Botwarden library.
#[derive(Debug, Error)]
pub enum WardenError {
    // Lifecycle failures
    #[error("Port {port} is still in use after attempting to free it")]
    PortUnavailable { port: u16 },

    #[error("No model artifact found in {dir}")]
    NoArtifactFound { dir: PathBuf },

    #[error("Failed to launch {role} process: {message}")]
    LaunchFailed { role: Role, message: String },

    #[error("Server did not become ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    #[error("Restart aborted on port {port}: {reason}")]
    RestartAborted { port: u16, reason: String },

    // Message relay errors
    #[error("Connection to the assistant server was reset")]
    RelayConnectionReset,

    #[error("Connection to the assistant server was refused")]
    RelayConnectionRefused,

    #[error("Assistant server did not answer within {0:?}")]
    RelayTimeout(Duration),

    #[error("Assistant server responded with status {status}")]
    RelayUpstream { status: u16 },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Botwarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for WardenError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WardenError::Timeout(Duration::from_secs(0))
        } else {
            WardenError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl WardenError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        WardenError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Stable tag identifying the failure class.
    ///
    /// Callers receive this alongside the message so they can branch on the
    /// failure without parsing display strings.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::PortUnavailable { .. } => "port_unavailable",
            WardenError::NoArtifactFound { .. } => "no_artifact_found",
            WardenError::LaunchFailed { .. } => "launch_failed",
            WardenError::ReadinessTimeout { .. } => "readiness_timeout",
            WardenError::RestartAborted { .. } => "restart_aborted",
            WardenError::RelayConnectionReset => "connection_reset",
            WardenError::RelayConnectionRefused => "connection_refused",
            WardenError::RelayTimeout(_) => "relay_timeout",
            WardenError::RelayUpstream { .. } => "upstream_error",
            WardenError::Network { .. } => "network",
            WardenError::Timeout(_) => "timeout",
            WardenError::Io { .. } => "io",
            WardenError::FileNotFound(_) => "file_not_found",
            WardenError::Json { .. } => "json",
            WardenError::Config { .. } => "config",
            WardenError::Validation { .. } => "validation",
            WardenError::Other(_) => "other",
        }
    }

    /// HTTP status code the routing layer should answer with.
    ///
    /// - 400: the request itself was invalid
    /// - 404: a requested file does not exist
    /// - 500: everything else
    pub fn http_status(&self) -> u16 {
        match self {
            WardenError::Validation { .. } => 400,
            WardenError::FileNotFound(_) => 404,
            _ => 500,
        }
    }
}
