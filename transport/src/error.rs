//! Error types for LANKA

use std::time::Duration;
use thiserror::Error;

/// Result type alias for handler and pipeline operations
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Configuration errors
///
/// Always fatal to the build or execution that raised them and never retried.
/// Each variant names the element that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The pipeline has no terminal transport
    #[error("pipeline '{pipeline}' has no primary handler")]
    MissingPrimaryHandler { pipeline: String },

    /// A handler factory produced nothing for this slot
    #[error("pipeline '{pipeline}' has no handler at position {position}")]
    MissingHandler { pipeline: String, position: usize },

    /// A policy selector returned no policy for a request
    #[error("policy selector '{selector}' returned no policy")]
    NoPolicySelected { selector: String },

    /// Invalid environment configuration
    #[error("invalid environment: {0}")]
    Env(String),

    /// Metrics registration failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Tracing subscriber could not be installed
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// The HTTP client could not be constructed
    #[error("http client error: {0}")]
    HttpClient(String),
}

/// Error type for a single send through a pipeline
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Pipeline or policy misconfiguration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Could not reach the destination
    #[error("connection error: {0}")]
    Connection(String),

    /// The destination was reached but the exchange failed
    #[error("send failed: {0}")]
    Send(String),

    /// An attempt ran out of time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The caller or a policy cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Catch-all for handler-specific failures
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Whether a policy may reasonably retry after this error
    ///
    /// Configuration errors and cancellation are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HandlerError::Connection(_) | HandlerError::Send(_) | HandlerError::Timeout(_)
        )
    }

    /// Whether this error is a cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled)
    }

    /// Whether this error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, HandlerError::Config(_))
    }
}

impl From<reqwest::Error> for HandlerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            HandlerError::Connection(err.to_string())
        } else {
            HandlerError::Send(err.to_string())
        }
    }
}
