//! Error types for the gateway

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower::BoxError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse failure taxonomy used for retry decisions and reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed input. Never retried.
    Validation,
    /// The completion call failed. Eligible for retry.
    Backend,
    /// Admission was denied for the caller's identity.
    RateLimit,
    /// The caller's cancellation signal or deadline fired.
    Cancellation,
    /// Chunked delivery ended in failure.
    Stream,
}

impl ErrorKind {
    /// Only backend failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Backend)
    }
}

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A required field was missing or held an unsupported value
    #[error("invalid field `{field}`: {message}")]
    Validation { field: &'static str, message: String },

    /// The completion backend reported a failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Admission control rejected the request
    #[error("rate limit exceeded for client `{client}`")]
    RateLimitExceeded { client: String },

    /// The operation observed its cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// The caller-supplied deadline elapsed
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Chunked delivery terminated with an error envelope
    #[error("stream error: {0}")]
    Stream(String),

    /// Every retry attempt failed; carries the last failure
    #[error("all {attempts} attempts failed, last error: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<GatewayError>,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Shorthand for a field-specific validation failure.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Where this error sits in the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation { .. } | GatewayError::Config(_) => ErrorKind::Validation,
            GatewayError::Backend(_) | GatewayError::Serialization(_) | GatewayError::Io(_) => {
                ErrorKind::Backend
            }
            GatewayError::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            GatewayError::Cancelled | GatewayError::DeadlineExceeded(_) => ErrorKind::Cancellation,
            GatewayError::Stream(_) => ErrorKind::Stream,
            GatewayError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    /// True for both explicit cancellation and an elapsed deadline.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    /// Recover a gateway error that crossed a Tower boundary as `BoxError`.
    ///
    /// Foreign errors are reported as backend failures.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<GatewayError>() {
            Ok(err) => *err,
            Err(other) => GatewayError::Backend(other.to_string()),
        }
    }
}
