//! Sync-specific error types

use relaycache_core::{CoreError, IdentityError};
use relaycache_state::StateError;
use thiserror::Error;

/// Errors reported by a relay transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the relay
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The relay refused the request or event
    #[error("Relay rejected request: {0}")]
    Rejected(String),

    /// The transport has been shut down
    #[error("Transport closed")]
    Closed,
}

/// Sync-specific errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store failure
    #[error(transparent)]
    State(#[from] StateError),

    /// Signing or encryption failure
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Relay transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Timeout
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// No identity capability is attached to the session
    #[error("Identity capability unavailable")]
    IdentityUnavailable,

    /// The session was torn down while the operation was in flight
    #[error("Sync session closed")]
    Cancelled,

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),
}

impl SyncError {
    /// Whether the next debounce cycle may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout { .. })
    }

    /// Whether a failed publish should run again on the next debounce cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Identity(_) | SyncError::State(StateError::Identity(_)) => {
                !self.is_identity_unavailable()
            }
            SyncError::State(e) => e.is_storage(),
            _ => self.is_transient(),
        }
    }

    /// Whether the session has lost its signer
    pub fn is_identity_unavailable(&self) -> bool {
        match self {
            SyncError::IdentityUnavailable => true,
            SyncError::Identity(e) | SyncError::State(StateError::Identity(e)) => e.is_unavailable(),
            _ => false,
        }
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Timeout { duration_ms: 10 }.is_transient());
        assert!(SyncError::from(TransportError::Closed).is_transient());
        assert!(!SyncError::Cancelled.is_transient());

        assert!(SyncError::IdentityUnavailable.is_identity_unavailable());
        assert!(SyncError::from(StateError::Identity(IdentityError::Unavailable))
            .is_identity_unavailable());
        assert!(!SyncError::from(IdentityError::Decrypt("bad".into())).is_identity_unavailable());
    }

    #[test]
    fn test_retryable_publish_failures() {
        assert!(SyncError::Timeout { duration_ms: 10 }.is_retryable());
        assert!(SyncError::from(StateError::Database("locked".into())).is_retryable());
        assert!(SyncError::from(IdentityError::Sign("busy".into())).is_retryable());
        assert!(!SyncError::from(IdentityError::Unavailable).is_retryable());
        assert!(!SyncError::from(StateError::MalformedPayload("x".into())).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }
}
