//! The durable local store interface
//!
//! The store holds three logical tables: conversation messages, read
//! markers and the sync bookkeeping singleton. Messages are scanned by
//! compound `(conversation, created_at)` and `(conversation, kind, created_at)`
//! ranges; markers are keyed by `(conversation, kind)`.

use async_trait::async_trait;
use std::ops::Bound;
use tokio::sync::broadcast;

use relaycache_core::{ConversationRef, Kind, ReadMarker, StoredMessage, SyncMeta, Timestamp};

use crate::error::Result;

/// Scan direction over `created_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// A range over one conversation's messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRange {
    /// Restrict to one kind (uses the `(conversation, kind, created_at)` index)
    pub kind: Option<Kind>,
    /// Restrict to one author
    pub author: Option<String>,
    /// Lower bound on `created_at`
    pub lower: Bound<Timestamp>,
    /// Upper bound on `created_at`
    pub upper: Bound<Timestamp>,
    pub order: Order,
    pub limit: Option<u32>,
}

impl Default for MessageRange {
    fn default() -> Self {
        Self {
            kind: None,
            author: None,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            order: Order::Ascending,
            limit: None,
        }
    }
}

impl MessageRange {
    /// Every message of the conversation, oldest first
    pub fn all() -> Self {
        Self::default()
    }

    /// Messages strictly newer than `timestamp`
    pub fn after(timestamp: Timestamp) -> Self {
        Self {
            lower: Bound::Excluded(timestamp),
            ..Self::default()
        }
    }

    /// The newest message only
    pub fn latest() -> Self {
        Self::default().descending().limit(1)
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.author = Some(pubkey.into());
        self
    }

    pub fn lower(mut self, bound: Bound<Timestamp>) -> Self {
        self.lower = bound;
        self
    }

    pub fn upper(mut self, bound: Bound<Timestamp>) -> Self {
        self.upper = bound;
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a timestamp falls inside the bounds
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        let above = match self.lower {
            Bound::Included(lo) => timestamp >= lo,
            Bound::Excluded(lo) => timestamp > lo,
            Bound::Unbounded => true,
        };
        let below = match self.upper {
            Bound::Included(hi) => timestamp <= hi,
            Bound::Excluded(hi) => timestamp < hi,
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Change notifications emitted after successful writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// New messages were stored in a conversation
    MessagesAdded {
        conversation: ConversationRef,
        count: usize,
    },
    /// A single marker was written
    MarkerChanged { conversation: ConversationRef, kind: Kind },
    /// The whole marker table was atomically replaced
    MarkersReplaced { count: usize },
    /// Markers older than a retention cutoff were deleted
    MarkersPruned { count: u64 },
    /// Markers and sync bookkeeping were wiped
    ReadStateCleared,
}

impl StoreChange {
    /// Whether this change can alter query results for `conversation`
    pub fn affects(&self, conversation: &ConversationRef) -> bool {
        match self {
            StoreChange::MessagesAdded { conversation: c, .. }
            | StoreChange::MarkerChanged { conversation: c, .. } => c == conversation,
            StoreChange::MarkersReplaced { .. }
            | StoreChange::MarkersPruned { .. }
            | StoreChange::ReadStateCleared => true,
        }
    }
}

/// Ordered, multi-index local table abstraction
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert a message; returns `true` if it was not stored before
    async fn put_message(&self, message: &StoredMessage) -> Result<bool>;

    /// Insert a batch of messages atomically; returns how many were new
    async fn put_messages(&self, messages: &[StoredMessage]) -> Result<usize>;

    /// Fetch a message by id
    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>>;

    /// Range scan over one conversation
    async fn scan_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
    ) -> Result<Vec<StoredMessage>>;

    /// Count messages in a range without loading them
    async fn count_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
        exclude_author: Option<&str>,
    ) -> Result<u64>;

    /// Count messages newer than `after` that reference `pubkey` in a `p` tag
    async fn count_mentions(
        &self,
        conversation: &ConversationRef,
        pubkey: &str,
        after: Timestamp,
    ) -> Result<u64>;

    /// Upsert a marker by `(conversation, kind)`
    async fn put_marker(&self, marker: &ReadMarker) -> Result<()>;

    /// Upsert a marker only if it is newer than the stored one
    async fn advance_marker(&self, marker: &ReadMarker) -> Result<bool>;

    /// Exact lookup by `(conversation, kind)`
    async fn get_marker(&self, conversation: &ConversationRef, kind: Kind)
        -> Result<Option<ReadMarker>>;

    /// Every marker of one conversation
    async fn markers_for(&self, conversation: &ConversationRef) -> Result<Vec<ReadMarker>>;

    /// Every marker in the store
    async fn all_markers(&self) -> Result<Vec<ReadMarker>>;

    /// Atomically clear all markers, insert `markers` and optionally
    /// persist new sync bookkeeping in the same transaction
    async fn replace_markers(&self, markers: &[ReadMarker], meta: Option<SyncMeta>) -> Result<()>;

    /// Delete markers with `created_at` strictly below `cutoff`;
    /// returns how many were removed
    async fn prune_markers(&self, cutoff: Timestamp) -> Result<u64>;

    /// Current sync bookkeeping (zeroed on first run)
    async fn sync_meta(&self) -> Result<SyncMeta>;

    /// Persist sync bookkeeping
    async fn set_sync_meta(&self, meta: SyncMeta) -> Result<()>;

    /// Delete all markers and sync bookkeeping
    async fn clear_read_state(&self) -> Result<()>;

    /// Subscribe to change notifications
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let range = MessageRange::after(10);
        assert!(!range.contains(10));
        assert!(range.contains(11));

        let range = MessageRange::all()
            .lower(Bound::Included(10))
            .upper(Bound::Excluded(20));
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
    }

    #[test]
    fn test_latest_range() {
        let range = MessageRange::latest();
        assert_eq!(range.order, Order::Descending);
        assert_eq!(range.limit, Some(1));
    }

    #[test]
    fn test_change_affects() {
        let a = ConversationRef::new("a");
        let b = ConversationRef::new("b");
        let change = StoreChange::MessagesAdded {
            conversation: a.clone(),
            count: 1,
        };
        assert!(change.affects(&a));
        assert!(!change.affects(&b));
        assert!(StoreChange::MarkersReplaced { count: 0 }.affects(&b));
    }
}
