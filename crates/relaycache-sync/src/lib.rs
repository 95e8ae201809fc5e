//! Relaycache Sync - Read-state replication across devices
//!
//! This crate keeps a user's read markers consistent across devices by
//! publishing them as a self-encrypted replaceable event on Nostr relays.
//!
//! # Overview
//!
//! One [`SyncService`] runs per signed-in account:
//!
//! - **Activation**: seed from the newest remote sync event, then open a
//!   live subscription for anything newer than the processed watermark
//! - **Intake**: skip stale events and own echoes, merge the rest into the
//!   local marker table in one transaction
//! - **Publish**: debounce local mark-read actions, fetch fresh remote
//!   state, merge, write locally and publish a new replaceable event
//!
//! # Example
//!
//! ```rust,ignore
//! use relaycache_sync::{SyncService, SyncSession};
//! use relaycache_state::SqliteStore;
//! use relaycache_core::ReadMarker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteStore::new("sqlite:relaycache.db?mode=rwc").await?);
//!     let session = SyncSession::new(pubkey, store, relay).with_identity(signer);
//!
//!     let (service, handle, mut events) = SyncService::new(session)?;
//!     tokio::spawn(async move {
//!         if let Err(e) = service.run().await {
//!             eprintln!("sync stopped: {e}");
//!         }
//!     });
//!
//!     handle.mark_read(ReadMarker::new("relay.example'general", 9, 1_700_000_000)).await?;
//!     handle.flush().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event;
pub mod service;
pub mod transport;

// Test doubles - available with test-utils feature or in tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


// Re-exports
pub use error::{Result, SyncError, TransportError};
pub use event::{SessionStatus, SyncEvent, SyncStats};
pub use service::{SyncCommand, SyncHandle, SyncService, SyncSession};
pub use transport::{FetchResult, Subscription, Transport};
