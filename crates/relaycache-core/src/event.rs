//! Signed relay events, subscription filters and relay messages
//!
//! Events are the unit of exchange with relays. The core never signs or
//! verifies signatures itself (that belongs to the identity capability),
//! but it does compute and check content-addressed event ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{CoreError, Result};

/// Event kind number
pub type Kind = u32;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Group chat message kind
pub const KIND_CHAT_MESSAGE: Kind = 9;

/// Direct message kind
pub const KIND_DIRECT_MESSAGE: Kind = 14;

/// First kind of the replaceable range
pub const REPLACEABLE_RANGE_START: Kind = 10_000;

/// One past the last kind of the replaceable range
pub const REPLACEABLE_RANGE_END: Kind = 20_000;

/// Whether relays keep only the newest event per author and kind
pub fn is_replaceable(kind: Kind) -> bool {
    (REPLACEABLE_RANGE_START..REPLACEABLE_RANGE_END).contains(&kind)
}

/// An event that has not yet been signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Create an unsigned event with no tags
    pub fn new(
        pubkey: impl Into<String>,
        created_at: Timestamp,
        kind: Kind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Attach tags
    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }

    /// Compute the content-addressed id: hex SHA-256 over
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    /// Turn into a signed event using a signature produced elsewhere
    pub fn into_signed(self, sig: impl Into<String>) -> SignedEvent {
        let id = self.id();
        SignedEvent {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        }
    }
}

/// A signed, content-addressed relay event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    /// Strip id and signature
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that the id matches the canonical serialization
    pub fn verify_id(&self) -> Result<()> {
        let expected = self.unsigned().id();
        if expected != self.id {
            return Err(CoreError::EventIdMismatch {
                expected,
                actual: self.id.clone(),
            });
        }
        Ok(())
    }

    /// First value of the first tag with the given name
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// Subscription / query filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Empty filter matching everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one kind
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Restrict to one author
    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    /// Inclusive lower bound on `created_at`
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Inclusive upper bound on `created_at`
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Maximum number of stored events to return
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &SignedEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        true
    }
}

/// Messages a relay subscription delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// A stored or live event
    Event(SignedEvent),
    /// The relay has sent every stored event matching the filter
    EndOfStoredEvents,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: Kind, created_at: Timestamp) -> SignedEvent {
        UnsignedEvent::new("ab".repeat(32), created_at, kind, "hello").into_signed("sig")
    }

    #[test]
    fn test_id_is_stable_and_verifiable() {
        let unsigned = UnsignedEvent::new("ab".repeat(32), 1_700_000_000, 1, "hello");
        let id = unsigned.id();
        assert_eq!(id.len(), 64);
        assert_eq!(id, unsigned.clone().id());

        let signed = unsigned.into_signed("sig");
        assert!(signed.verify_id().is_ok());
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let mut signed = event(1, 1_700_000_000);
        signed.content = "tampered".into();
        assert!(matches!(
            signed.verify_id(),
            Err(CoreError::EventIdMismatch { .. })
        ));
    }

    #[test]
    fn test_filter_matches() {
        let ev = event(10_888, 500);
        let filter = Filter::new().kind(10_888).author("ab".repeat(32)).since(500);
        assert!(filter.matches(&ev));

        assert!(!Filter::new().since(501).matches(&ev));
        assert!(!Filter::new().until(499).matches(&ev));
        assert!(!Filter::new().kind(9).matches(&ev));
        assert!(!Filter::new().author("cd").matches(&ev));
    }

    #[test]
    fn test_replaceable_range() {
        assert!(is_replaceable(10_000));
        assert!(is_replaceable(19_999));
        assert!(!is_replaceable(20_000));
        assert!(!is_replaceable(KIND_CHAT_MESSAGE));
    }

    #[test]
    fn test_tag_value() {
        let ev = UnsignedEvent::new("pk", 1, 9, "")
            .with_tags(vec![vec!["h".into(), "group9".into()]])
            .into_signed("sig");
        assert_eq!(ev.tag_value("h"), Some("group9"));
        assert_eq!(ev.tag_value("p"), None);
    }
}
