//! Error types for the telemetry pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for telemetry pipeline operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Notification channel delivery failure
    #[error("Channel delivery failed: {0}")]
    Channel(String),

    /// Telemetry batch flush failure
    #[error("Batch flush failed: {0}")]
    Flush(String),

    /// Durable metrics sink failure
    #[error("Metrics sink error: {0}")]
    Sink(String),

    /// Malformed ingestion input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Channel("webhook timed out".to_string());
        assert!(err.to_string().contains("webhook timed out"));

        let err = Error::Config("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }
}
