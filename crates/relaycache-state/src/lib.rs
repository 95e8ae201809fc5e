//! Relaycache State - Local persistence and read-state logic
//!
//! This crate provides the durable local store and the pure logic layered
//! on top of it.
//!
//! ## Components
//!
//! - **store**: the `LocalStore` interface, ranges and change notifications
//! - **storage**: SQLite-based persistence with sqlx
//! - **memory**: B-tree backed in-process store
//! - **query**: unread counts, last-message lookups and recency sorting
//! - **codec**: read-marker wire encoding, validation and self-encryption
//! - **merge**: last-write-wins merge of read markers
//! - **error**: State-specific error types
//!
//! ## Example
//!
//! ```ignore
//! use relaycache_state::{query, LocalStore, SqliteStore};
//! use relaycache_core::{ConversationRef, ReadMarker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::new("sqlite:relaycache.db?mode=rwc").await?;
//!     let conversation = ConversationRef::group("relay.example", "general");
//!
//!     store.advance_marker(&ReadMarker::new(conversation.clone(), 9, 1_700_000_000)).await?;
//!     let unread = query::unread_count(&store, &conversation, Some("my-pubkey")).await?;
//!     println!("{unread} unread");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod memory;
pub mod merge;
pub mod query;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use codec::{DecodeReport, WireEntry};
pub use error::{Result, StateError};
pub use memory::MemoryStore;
pub use merge::merge;
pub use query::ConversationWatch;
pub use storage::SqliteStore;
pub use store::{LocalStore, MessageRange, Order, StoreChange};
