//! Error types shared by the relaycache crates
//!
//! Covers the failures that can happen while constructing or validating
//! domain values. Storage and sync layers define their own error enums
//! and convert into this one where they cross crate boundaries.

use thiserror::Error;

/// Main error type for relaycache domain values
#[derive(Error, Debug)]
pub enum CoreError {
    // ===== Identity & Signing Errors =====
    /// Event id does not match its canonical serialization
    #[error("Event id mismatch: expected {expected}, got {actual}")]
    EventIdMismatch { expected: String, actual: String },

    /// Public key is not valid hex
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    // ===== Conversation & Message Errors =====
    /// Conversation reference was empty or malformed
    #[error("Invalid conversation reference: {0}")]
    InvalidConversation(String),

    /// Event could not be turned into a stored message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Field exceeded the configured length bound
    #[error("Field {field} too long: {len} chars exceeds maximum {max}")]
    FieldTooLong { field: String, len: usize, max: usize },

    /// Timestamp outside the accepted window
    #[error("Timestamp {timestamp} outside accepted range [{min}, {max}]")]
    TimestampOutOfRange { timestamp: i64, min: i64, max: i64 },

    // ===== Serialization Errors =====
    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Network timeout
    #[error("Timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::Timeout { .. })
    }

    /// Check if this error is a client error (bad input)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::EventIdMismatch { .. }
                | CoreError::InvalidPublicKey(_)
                | CoreError::InvalidConversation(_)
                | CoreError::InvalidMessage(_)
                | CoreError::FieldTooLong { .. }
                | CoreError::TimestampOutOfRange { .. }
                | CoreError::InvalidConfig(_)
        )
    }

    /// Get an error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::EventIdMismatch { .. } => "EVENT_ID_MISMATCH",
            CoreError::InvalidPublicKey(_) => "INVALID_PUBLIC_KEY",
            CoreError::InvalidConversation(_) => "INVALID_CONVERSATION",
            CoreError::InvalidMessage(_) => "INVALID_MESSAGE",
            CoreError::FieldTooLong { .. } => "FIELD_TOO_LONG",
            CoreError::TimestampOutOfRange { .. } => "TIMESTAMP_OUT_OF_RANGE",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Deserialization(_) => "DESERIALIZATION_ERROR",
            CoreError::InvalidConfig(_) => "INVALID_CONFIG",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for relaycache core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CoreError::Deserialization(err.to_string())
        } else {
            CoreError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::InvalidConversation("".to_string());
        assert_eq!(err.error_code(), "INVALID_CONVERSATION");
    }

    #[test]
    fn test_is_retriable() {
        assert!(CoreError::Timeout { duration_ms: 1000 }.is_retriable());
        assert!(!CoreError::Cancelled.is_retriable());
    }

    #[test]
    fn test_is_client_error() {
        assert!(CoreError::InvalidConfig("x".into()).is_client_error());
        assert!(!CoreError::Internal("test".to_string()).is_client_error());
    }

    #[test]
    fn test_json_errors_map_to_deserialization() {
        let err: CoreError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.error_code(), "DESERIALIZATION_ERROR");
    }
}
