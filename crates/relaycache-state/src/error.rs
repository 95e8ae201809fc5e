//! Error types for the state management layer

use relaycache_core::{CoreError, IdentityError};
use thiserror::Error;

/// Errors that can occur in state operations
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Payload was not a JSON array of wire entries
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Identity capability failed during encrypt/decrypt
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Domain value error
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StateError {
    /// Whether the error came from the storage engine
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StateError::Database(_) | StateError::Connection(_) | StateError::Schema(_)
        )
    }
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StateError::NotFound {
                entity: "record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StateError::Connection(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StateError::Deserialization(err.to_string())
            }
            _ => StateError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            StateError::Deserialization(err.to_string())
        } else {
            StateError::Serialization(err.to_string())
        }
    }
}

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;
