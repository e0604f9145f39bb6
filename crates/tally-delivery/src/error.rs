//! Error types for webhook delivery operations.
//!
//! Subscriber-side failures fall into three categories that drive the retry
//! decision: configuration errors are never retried, transport and
//! application errors are. Store and engine errors describe problems on our
//! side and never touch an attempt's retry budget.

use std::{fmt, time::Duration};

use tally_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Delivery cannot succeed without a configuration change.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// What is wrong with the subscription or payload
        message: String,
    },

    /// Network-level connectivity failure, including DNS and TLS.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Subscriber answered with a non-2xx status.
    #[error("subscriber responded with HTTP {status_code}")]
    ApplicationError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Registry or delivery store operation failed.
    #[error("store error: {message}")]
    StoreError {
        /// Underlying error message
        message: String,
    },

    /// Event intake is at capacity.
    #[error("event queue is full")]
    QueueFull,

    /// Engine is shutting down and accepts no more work.
    #[error("delivery engine shutdown requested")]
    ShutdownRequested,

    /// Graceful shutdown did not finish in time.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// Time allowed for in-flight work to drain
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an application error from an HTTP response.
    pub fn application(status_code: u16, body: impl Into<String>) -> Self {
        Self::ApplicationError { status_code, body: body.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Returns true if the subscriber might accept the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::ApplicationError { .. }
        )
    }

    /// Returns the HTTP status code for application errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ApplicationError { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Returns the error category for logging and statistics.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::StoreError { message: err.to_string() }
    }
}

/// Error categories for retry decisions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad URL, missing secret, oversized payload. Not retried.
    Configuration,
    /// Connection, DNS, TLS and timeout failures. Retried.
    Transport,
    /// Non-2xx responses. Retried.
    Application,
    /// Registry or delivery store problems.
    Store,
    /// Engine lifecycle and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Transport,
            DeliveryError::ApplicationError { .. } => Self::Application,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::QueueFull
            | DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Application => write!(f, "application"),
            Self::Store => write!(f, "store"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
