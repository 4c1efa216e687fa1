//! Error types for the SMS broker.

use std::time::Duration;

/// Top-level error type returned by every broker operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(DatabaseError),

    #[error("Secure randomness unavailable: {0}")]
    Entropy(String),

    #[error("Filter pipeline is shut down")]
    PipelineClosed,
}

impl Error {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            DatabaseError::Constraint(msg) => Self::Conflict(msg),
            other => Self::Storage(other),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Moderation endpoint failures. Recorded as the `error` status on the
/// affected request rather than returned to a caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilterError {
    #[error("Moderation request failed: {0}")]
    Transport(String),

    #[error("Moderation endpoint returned non-200 status: {status}")]
    Status { status: u16 },

    #[error("Invalid moderation response: {0}")]
    InvalidResponse(String),

    #[error("Moderation request timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;
