//! Error types for the storage and provider seams.
//!
//! Per-entry failures are recorded on the entry itself and never surface as
//! these errors; a `StoreError` means the datastore itself misbehaved.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by any store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database rejected or failed an operation.
    #[error("database error: {0}")]
    Database(String),

    /// A stored JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for StoreError {
    fn from(e: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Errors raised by a provider adapter while sending.
///
/// All variants are transient from the dispatcher's point of view and go
/// through the retry policy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("provider response missing message id")]
    MissingId,

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_messages() {
        let err = ProviderError::Rejected {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "provider rejected message with status 503: unavailable"
        );

        let err = ProviderError::Timeout(Duration::from_secs(10));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_store_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
