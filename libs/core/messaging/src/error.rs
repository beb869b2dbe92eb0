//! Error types for event handling.

use thiserror::Error;

/// Error returned by an [`EventHandler`](crate::EventHandler).
///
/// Every variant leads to the same outcome in the ingestion core: the message is
/// negatively acknowledged and redelivered by the broker. The variants only exist so
/// logs say *why* a handler gave up.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The handler ran and failed.
    #[error("handler failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload decoded but lacks something the handler needs.
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

impl ProcessingError {
    /// Create a failure without an underlying cause.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping the error that caused it.
    pub fn failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unexpected payload error.
    pub fn unexpected_payload(message: impl Into<String>) -> Self {
        Self::UnexpectedPayload(message.into())
    }
}
