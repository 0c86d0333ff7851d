//! Error handling for chatstack.
use std::path::PathBuf;

use thiserror::Error;

/// Problems detected while resolving the run configuration. Reported before any
/// process is launched, so there is never anything to clean up.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An override could not be parsed or failed range validation.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// The option that was being resolved.
        key: String,
        /// The raw value as supplied.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two services were configured to listen on the same port.
    #[error("Port {port} is assigned to both {first} and {second}")]
    DuplicatePort {
        /// The contested port.
        port: u16,
        /// First option holding the port.
        first: &'static str,
        /// Second option holding the port.
        second: &'static str,
    },

    /// A settings value references an environment variable that is not defined.
    #[error("Missing environment variable '{0}' referenced in settings")]
    MissingVariable(String),

    /// The settings or dotenv file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid YAML or carries unknown keys.
    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn invalid(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// A service could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    Spawn {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The per-service log sink could not be prepared.
    #[error("Failed to open log sink {} for service '{service}': {source}", path.display())]
    LogSink {
        /// The service whose sink failed.
        service: String,
        /// Path of the log file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Name of the service that failed to launch.
    pub fn service(&self) -> &str {
        match self {
            LaunchError::Spawn { service, .. } | LaunchError::LogSink { service, .. } => {
                service
            }
        }
    }
}

/// Top-level error surfaced by the binary.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Termination signals could not be intercepted.
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// The readiness probe client could not be built.
    #[error("Failed to build probe client: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic I/O failure (log inspection, output).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A service log could not be shown.
    #[error(transparent)]
    Logs(#[from] LogsError),

    /// Plan serialization failed.
    #[error("Failed to render plan: {0}")]
    Render(#[from] serde_json::Error),
}

/// Errors raised while reading service logs.
#[derive(Debug, Error)]
pub enum LogsError {
    /// The name is not one of the stack's services.
    #[error("Unknown service '{0}' (expected one of registry, worker, api, web)")]
    UnknownService(String),

    /// No log file exists for the service.
    #[error("No log file for service '{service}' at {}", path.display())]
    NotFound {
        /// Service that was requested.
        service: String,
        /// Where the log was expected.
        path: PathBuf,
    },

    /// The log file exists but could not be read.
    #[error("Failed to read log: {0}")]
    Read(#[from] std::io::Error),
}
