//! Error taxonomy shared by handlers, backends and the execution monitor.

use thiserror::Error;

/// Errors produced while servicing a command or running a generation job.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Missing or invalid credential, URL, directory or backend selection.
    #[error("{0}")]
    Configuration(String),

    /// A frame could not be read from or decoded off the pipe.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection refused, DNS failure, timeout.
    #[error("{context}: {source}")]
    Network {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote service answered with a non-success status.
    #[error("{context} failed with status code {status}")]
    HttpStatus {
        context: String,
        status: u16,
        body: String,
    },

    /// The remote service answered, but not in the shape we expected.
    #[error("{0}")]
    Protocol(String),

    /// Directory not creatable or file not writable.
    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The source image could not be decoded or re-encoded.
    #[error("{context}: {source}")]
    Image {
        context: String,
        #[source]
        source: image::ImageError,
    },

    /// The external container runtime failed or timed out.
    #[error("{0}")]
    Container(String),

    /// The container runtime executable is not installed.
    #[error("{0} command not found")]
    RuntimeNotFound(String),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking helper task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PluginError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn network(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            context: context.into(),
            source,
        }
    }

    pub fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }

    /// Whether the underlying network failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Network { source, .. } if source.is_timeout())
    }

    /// Whether the request never reached the service.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Network { source, .. } if source.is_connect())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PluginError>;
