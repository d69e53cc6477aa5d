//! Error types for core-gateway.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error on the backend socket or while reading schema files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Schema source could not be parsed or registered.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Authenticated call path invoked without a caller identity.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Message name is not present in the registry.
    #[error("Invalid message type: {0}")]
    UnknownMessageType(String),

    /// Numeric message id is not present in the registry.
    #[error("Unknown message id: {0:#06x}")]
    UnknownMessageId(u16),

    /// Payload data does not fit the message schema.
    #[error("Encode failure for {message}: {reason}")]
    EncodeFailure { message: String, reason: String },

    /// Payload bytes are malformed for the resolved message type.
    #[error("Decode failure for {message}: {reason}")]
    DecodeFailure { message: String, reason: String },

    /// Every context slot is in use.
    #[error("Server busy")]
    Busy,

    /// The backend answered but no usable reply could be produced.
    #[error("Empty reply")]
    EmptyReply,

    /// The reply carries an explicit error from the backend.
    #[error("Backend error: {message}")]
    BackendError { code: i64, message: String },

    /// No reply arrived before the reply timeout.
    #[error("Request in context {context_id} timed out after {elapsed:?}")]
    Timeout { context_id: u16, elapsed: Duration },

    /// Framing or handshake violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection to the backend is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue stayed full for the whole backpressure timeout.
    #[error("Backpressure timeout: outbound queue is full")]
    BackpressureTimeout,

    /// Backend API version is not compatible with the loaded schema.
    #[error("Incompatible backend API version {0}")]
    IncompatibleVersion(String),
}

impl GatewayError {
    pub(crate) fn encode(message: &str, reason: impl Into<String>) -> Self {
        Self::EncodeFailure {
            message: message.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(message: &str, reason: impl Into<String>) -> Self {
        Self::DecodeFailure {
            message: message.to_string(),
            reason: reason.into(),
        }
    }

    /// Status code a web-facing caller should answer with.
    ///
    /// `Busy` is kept apart from backend failures so it can be surfaced as a
    /// retryable "server busy".
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotAuthenticated => 401,
            GatewayError::Busy | GatewayError::BackpressureTimeout => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::UnknownMessageType(_) | GatewayError::EncodeFailure { .. } => 400,
            _ => 500,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Busy
                | GatewayError::Timeout { .. }
                | GatewayError::ConnectionClosed
                | GatewayError::BackpressureTimeout
        )
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
