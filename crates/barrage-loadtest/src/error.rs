//! Error types for the load test engine

use barrage_core::{ConfigError, MetricsError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, LoadTestError>;

/// A request that could not complete at all.
///
/// HTTP error statuses are responses, not transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Short label used as a log field and error tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Other(_) => "other",
        }
    }
}

/// Fatal run errors.
///
/// Anything that happens inside a VU iteration is absorbed into metrics and
/// never surfaces here.
#[derive(Error, Debug)]
pub enum LoadTestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric schema error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Executor failure in scenario '{scenario}': {reason}")]
    Executor { scenario: String, reason: String },
}
