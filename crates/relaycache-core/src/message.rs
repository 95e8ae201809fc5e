//! Stored conversation messages

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationRef;
use crate::event::{Kind, SignedEvent, Timestamp};

/// Tag name used to reference a public key
pub const PUBKEY_TAG: &str = "p";

/// A message persisted in the local store.
///
/// Messages are signed and content-addressed, so they are never mutated
/// once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Content-addressed event id
    pub id: String,
    /// Conversation the message belongs to
    pub conversation: ConversationRef,
    pub kind: Kind,
    pub created_at: Timestamp,
    /// Author public key
    pub pubkey: String,
    pub content: String,
    pub tags: Vec<Vec<String>>,
}

impl StoredMessage {
    /// Build a stored message from a relay event
    pub fn from_event(event: &SignedEvent, conversation: ConversationRef) -> Self {
        Self {
            id: event.id.clone(),
            conversation,
            kind: event.kind,
            created_at: event.created_at,
            pubkey: event.pubkey.clone(),
            content: event.content.clone(),
            tags: event.tags.clone(),
        }
    }

    /// Public keys referenced through `p` tags, deduplicated in tag order
    pub fn mentions(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for tag in &self.tags {
            if tag.first().map(String::as_str) != Some(PUBKEY_TAG) {
                continue;
            }
            if let Some(pubkey) = tag.get(1) {
                if !out.contains(&pubkey.as_str()) {
                    out.push(pubkey);
                }
            }
        }
        out
    }

    /// Whether the message references the given public key
    pub fn mentions_pubkey(&self, pubkey: &str) -> bool {
        self.mentions().contains(&pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;

    #[test]
    fn test_from_event() {
        let event = UnsignedEvent::new("alice", 42, 9, "hi")
            .with_tags(vec![
                vec!["p".into(), "bob".into()],
                vec!["e".into(), "ref".into()],
                vec!["p".into(), "bob".into()],
                vec!["p".into(), "carol".into(), "wss://relay".into()],
            ])
            .into_signed("sig");

        let msg = StoredMessage::from_event(&event, ConversationRef::new("relay1'group9"));
        assert_eq!(msg.id, event.id);
        assert_eq!(msg.created_at, 42);
        assert_eq!(msg.mentions(), vec!["bob", "carol"]);
        assert!(msg.mentions_pubkey("carol"));
        assert!(!msg.mentions_pubkey("alice"));
    }
}
