//! Read markers and sync bookkeeping

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationRef;
use crate::event::{Kind, Timestamp};

/// Key identifying one logical read marker
pub type MarkerKey = (ConversationRef, Kind);

/// The newest message timestamp the user has seen in a conversation,
/// tracked separately per message kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadMarker {
    pub conversation: ConversationRef,
    pub kind: Kind,
    pub created_at: Timestamp,
    /// Tag name of the anchoring reference (e.g. `e`), empty when unset
    #[serde(default)]
    pub tag: String,
    /// Anchoring reference value (e.g. an event id), empty when unset
    #[serde(default, rename = "ref")]
    pub reference: String,
}

impl ReadMarker {
    /// Create a marker without an anchoring reference
    pub fn new(conversation: impl Into<ConversationRef>, kind: Kind, created_at: Timestamp) -> Self {
        Self {
            conversation: conversation.into(),
            kind,
            created_at,
            tag: String::new(),
            reference: String::new(),
        }
    }

    /// Anchor the marker to a specific tag/reference
    pub fn with_reference(mut self, tag: impl Into<String>, reference: impl Into<String>) -> Self {
        self.tag = tag.into();
        self.reference = reference.into();
        self
    }

    /// The merge key of this marker
    pub fn key(&self) -> MarkerKey {
        (self.conversation.clone(), self.kind)
    }

    /// Whether this marker should replace `other` for the same key
    pub fn supersedes(&self, other: &ReadMarker) -> bool {
        self.created_at > other.created_at
    }
}

/// Process-wide sync bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// `created_at` this device last attached to an outgoing sync event
    pub last_published: Timestamp,
    /// `created_at` of the newest remote sync event already handled
    pub last_processed: Timestamp,
}

impl SyncMeta {
    /// Record a successful publish. `last_processed` never moves backwards.
    pub fn published(self, created_at: Timestamp) -> Self {
        Self {
            last_published: created_at,
            last_processed: self.last_processed.max(created_at),
        }
    }

    /// Earliest `created_at` an outgoing event may carry so that it
    /// replaces everything this device has published or merged
    pub fn next_publish_at(&self, now: Timestamp) -> Timestamp {
        now.max(self.last_published + 1).max(self.last_processed + 1)
    }

    /// Record a processed remote event
    pub fn processed(self, created_at: Timestamp) -> Self {
        Self {
            last_processed: created_at,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersedes_is_strict() {
        let a = ReadMarker::new("c", 9, 100);
        let b = ReadMarker::new("c", 9, 100).with_reference("e", "x");
        let c = ReadMarker::new("c", 9, 101);
        assert!(!a.supersedes(&b));
        assert!(c.supersedes(&a));
        assert_eq!(a.key(), c.key());
    }

    #[test]
    fn test_sync_meta_transitions() {
        let meta = SyncMeta::default().processed(50);
        assert_eq!(meta, SyncMeta { last_published: 0, last_processed: 50 });

        let meta = meta.published(70);
        assert_eq!(meta.last_published, 70);
        assert_eq!(meta.last_processed, 70);
    }

    #[test]
    fn test_published_keeps_newer_processed() {
        let meta = SyncMeta::default().processed(160).published(100);
        assert_eq!(meta, SyncMeta { last_published: 100, last_processed: 160 });
    }

    #[test]
    fn test_next_publish_at_outruns_merged_remote() {
        let meta = SyncMeta { last_published: 90, last_processed: 160 };
        assert_eq!(meta.next_publish_at(100), 161);
        assert_eq!(meta.next_publish_at(500), 500);
        assert_eq!(SyncMeta::default().next_publish_at(100), 100);
    }
}
