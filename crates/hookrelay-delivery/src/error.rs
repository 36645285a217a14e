//! Error types for webhook delivery operations.
//!
//! Response classification never produces an error: every HTTP status and
//! transport failure maps to an outcome. Errors here are infrastructure
//! faults (storage, queue, worker lifecycle) and rejected input.

use std::fmt;

use hookrelay_core::{CoreError, ValidationError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Event or registration rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Record store operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// A task could not be placed on the queue.
    #[error("task queue unavailable: {message}")]
    QueueUnavailable {
        /// Queue error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Engine was started twice.
    #[error("delivery engine already running")]
    AlreadyRunning,

    /// Workers did not stop within the shutdown timeout.
    #[error("workers did not stop within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Shutdown timeout that elapsed
        timeout_seconds: u64,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Identifier of the failed worker
        worker_id: usize,
        /// Join error description
        message: String,
    },
}

impl DeliveryError {
    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueUnavailable { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns whether the failed operation should be attempted again.
    ///
    /// Storage and queue faults are transient. Rejected input and lifecycle
    /// errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { .. } | Self::QueueUnavailable { .. } => true,

            Self::Validation(_)
            | Self::Configuration { .. }
            | Self::AlreadyRunning
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(validation) => Self::Validation(validation),
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected input.
    Validation,
    /// Record store failures.
    Database,
    /// Task queue failures.
    Queue,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle problems.
    Lifecycle,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Validation(_) => Self::Validation,
            DeliveryError::Database { .. } => Self::Database,
            DeliveryError::QueueUnavailable { .. } => Self::Queue,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::AlreadyRunning
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Lifecycle,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Database => write!(f, "database"),
            Self::Queue => write!(f, "queue"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::database("connection lost").is_retryable());
        assert!(DeliveryError::queue("closed").is_retryable());

        assert!(!DeliveryError::Validation(ValidationError::BlankPayload).is_retryable());
        assert!(!DeliveryError::configuration("zero workers").is_retryable());
        assert!(!DeliveryError::ShutdownTimeout { timeout_seconds: 30 }.is_retryable());
    }

    #[test]
    fn core_errors_convert_by_kind() {
        let err = DeliveryError::from(CoreError::Validation(ValidationError::BlankEventType));
        assert!(matches!(err, DeliveryError::Validation(ValidationError::BlankEventType)));

        let err = DeliveryError::from(CoreError::Database("pool timed out".into()));
        assert!(matches!(err, DeliveryError::Database { .. }));
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::Database);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            DeliveryError::ShutdownTimeout { timeout_seconds: 30 }.to_string(),
            "workers did not stop within 30s"
        );
        assert_eq!(ErrorCategory::Lifecycle.to_string(), "lifecycle");
    }
}
