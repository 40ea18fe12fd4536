//! Error types for floodgate.

use thiserror::Error;

/// Main error type for floodgate operations.
///
/// A rejected request is not an error: capacity exhaustion is reported as a
/// [`Decision`](crate::ratelimit::Decision) with `admitted == false`.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// The backing store could not be reached or failed mid-operation.
    #[error("{backend} store unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },

    /// A guard check failed. These indicate an integration bug and are
    /// never subject to the fail-open policy.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store was used before `init` was called on it.
    #[error("{0} store used before init")]
    NotInitialized(&'static str),

    /// The throttle queue cannot hold the requested cost.
    #[error("Queue overflow: cost {requested} exceeds capacity {capacity}")]
    QueueOverflow { requested: f64, capacity: f64 },

    /// The throttle queue was closed while the item was pending.
    #[error("Queue closed")]
    QueueClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Build a [`FloodgateError::BackendUnavailable`] for the named backend.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        FloodgateError::BackendUnavailable {
            backend,
            message: message.into(),
        }
    }

    /// Whether this error is subject to the fail-open policy.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            FloodgateError::BackendUnavailable { .. } | FloodgateError::NotInitialized(_)
        )
    }
}

impl From<redis::RedisError> for FloodgateError {
    fn from(err: redis::RedisError) -> Self {
        FloodgateError::backend("redis", err.to_string())
    }
}

impl From<sqlx::Error> for FloodgateError {
    fn from(err: sqlx::Error) -> Self {
        FloodgateError::backend("postgres", err.to_string())
    }
}

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
