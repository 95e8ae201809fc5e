//! Relaycache Core - Foundational types for the local-first relay cache
//!
//! This crate provides the domain types shared by the storage and sync
//! layers of a Nostr chat client: conversations, stored messages, read
//! markers, signed relay events and the identity capability interface.
//!
//! # Modules
//!
//! - [`conversation`] - Opaque conversation references
//! - [`message`] - Stored conversation messages
//! - [`marker`] - Read markers and sync bookkeeping
//! - [`event`] - Signed events, filters and relay messages
//! - [`identity`] - Signing / self-encryption capability
//! - [`config`] - Configuration types
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust
//! use relaycache_core::{ConversationRef, ReadMarker};
//!
//! let conversation = ConversationRef::group("relay.example", "general");
//! let marker = ReadMarker::new(conversation.clone(), 9, 1_700_000_000);
//! assert_eq!(marker.key(), (conversation, 9));
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod identity;
pub mod marker;
pub mod message;

// Re-exports for convenience
pub use config::{RelayCacheConfig, StorageConfig, SyncConfig, ValidationLimits};
pub use conversation::ConversationRef;
pub use error::{CoreError, Result};
pub use event::{Filter, Kind, RelayMessage, SignedEvent, Timestamp, UnsignedEvent};
pub use identity::{Identity, IdentityError};
pub use marker::{MarkerKey, ReadMarker, SyncMeta};
pub use message::StoredMessage;

/// Source of wall-clock time in unix seconds
pub trait Clock: Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.contains('.'), "VERSION should be semver format");
    }

    #[test]
    fn test_system_clock_is_after_floor() {
        assert!(SystemClock.now() > config::DEFAULT_MIN_TIMESTAMP);
    }
}
