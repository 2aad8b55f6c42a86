use thiserror::Error;

/// Failure taxonomy for the ingestion paths.
///
/// `Persistence` and `Connection` are transient and worth retrying;
/// everything else aborts the operation that produced it.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("storage unavailable: {0}")]
    Persistence(String),

    #[error("storage schema mismatch: {0}")]
    Schema(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Persistence(_) | IngestError::Connection(_)
        )
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        IngestError::Connection(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        IngestError::Connection(e.to_string())
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(e: config::ConfigError) -> Self {
        IngestError::Configuration(e.to_string())
    }
}
