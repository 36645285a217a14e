//! Error types and result handling for core operations.
//!
//! Storage failures are mapped from sqlx into a small taxonomy, and input
//! validation failures carry a typed reason so callers can tell a rejected
//! registration or event apart from an infrastructure fault.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Input rejected before touching storage.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Returns whether the failure is transient and worth retrying.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Reasons an endpoint registration or event dispatch is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Endpoint URL is missing or whitespace.
    #[error("endpoint url must be present")]
    EmptyUrl,

    /// Endpoint URL is not an absolute http(s) URL.
    #[error("endpoint url {url:?} is invalid: {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Parser or scheme failure description
        reason: String,
    },

    /// Subscription list is empty.
    #[error("endpoint must subscribe to at least one event type")]
    NoSubscriptions,

    /// A subscription entry is blank.
    #[error("subscription entries must not be blank")]
    BlankSubscription,

    /// Event type is missing or whitespace.
    #[error("event type must be present")]
    BlankEventType,

    /// Payload is null, false, or an empty string, array or object.
    #[error("event payload must be present")]
    BlankPayload,
}
