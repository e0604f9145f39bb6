//! Error types for registry, store and state machine operations.
//!
//! Everything in this crate returns `CoreError`. Storage failures are mapped
//! from `sqlx::Error` so callers can tell constraint violations apart from
//! connectivity problems.

use thiserror::Error;

use crate::attempt::AttemptStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for registry and delivery store operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation, for example a duplicate attempt number.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input rejected by validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A delivery attempt was asked to move through an edge its state machine
    /// does not have.
    #[error("Invalid transition: cannot {action} an attempt in state {from}")]
    InvalidTransition {
        /// State the attempt was in when the transition was requested
        from: AttemptStatus,
        /// Name of the rejected transition
        action: &'static str,
    },
}

impl CoreError {
    /// Creates a not found error for an entity kind and identifier.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id}"))
    }

    /// Creates a validation error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns true when the error was caused by a lost compare-and-set race
    /// or a terminal state, rather than by storage itself.
    pub fn is_transition_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::ConstraintViolation(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
