//! Error types for the ingestion core.

use messaging::ScopeId;
use thiserror::Error;

/// Error that can occur while connecting, setting up or tearing down consumers.
///
/// Handler failures never surface here; they are settled per message by negative
/// acknowledgement.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Broker unreachable or handshake failed
    #[error("NATS connection error: {0}")]
    Connection(String),

    /// JetStream API call failed (stream or consumer management)
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Subscribing to or reading from a consumer failed
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Repository identifier is not exactly `owner/name`
    #[error("Invalid repository identifier '{0}': expected owner/name")]
    InvalidRepository(String),

    /// A scope resolved to an empty subject set
    #[error("Scope {0} has no subjects to subscribe to")]
    NoSubjects(ScopeId),

    /// The subscription provider does not know the scope
    #[error("Scope {0} not found")]
    ScopeNotFound(ScopeId),

    /// Request timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Shutdown was requested while the operation was in progress
    #[error("Shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Create a JetStream error from any displayable async-nats error.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a consumer error.
    pub fn consumer_error(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }

    /// Connection-level failures are retried by the connection manager; everything else
    /// is reported to the caller and left to the next start request.
    pub fn is_connection(&self) -> bool {
        matches!(self, IngestError::Connection(_) | IngestError::Timeout(_))
    }
}

impl From<async_nats::ConnectError> for IngestError {
    fn from(error: async_nats::ConnectError) -> Self {
        use async_nats::ConnectErrorKind;

        match error.kind() {
            ConnectErrorKind::TimedOut => Self::Timeout(error.to_string()),
            // Unparsable URL, retrying cannot help
            ConnectErrorKind::ServerParse => Self::Config(error.to_string()),
            _ => Self::Connection(error.to_string()),
        }
    }
}
