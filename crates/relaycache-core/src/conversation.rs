//! Conversation references
//!
//! A conversation is either a relay-hosted group or a set of direct-message
//! participants. Both are reduced to a single opaque string key; everything
//! downstream compares keys by exact string equality.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CoreError, Result};

/// Separator between relay and group id in group references
pub const GROUP_SEPARATOR: char = '\'';

/// Separator between participant keys in direct-message references
pub const PARTICIPANT_SEPARATOR: char = ',';

/// Opaque identifier for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationRef(String);

impl ConversationRef {
    /// Wrap a raw key without validation
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Parse a raw key, rejecting empty input
    pub fn parse(key: &str) -> Result<Self> {
        if key.trim().is_empty() {
            return Err(CoreError::InvalidConversation(
                "conversation key is empty".into(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    /// Reference for a relay-scoped group, e.g. `relay.example'general`
    pub fn group(relay: &str, group_id: &str) -> Self {
        let relay = relay
            .trim_start_matches("wss://")
            .trim_start_matches("ws://")
            .trim_end_matches('/');
        Self(format!("{relay}{GROUP_SEPARATOR}{group_id}"))
    }

    /// Reference for a direct-message group.
    ///
    /// Participant keys are sorted and deduplicated so every member
    /// derives the same key regardless of ordering.
    pub fn direct<I, S>(participants: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = participants
            .into_iter()
            .map(|p| p.as_ref().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            return Err(CoreError::InvalidConversation(
                "direct conversation has no participants".into(),
            ));
        }

        Ok(Self(keys.join(&PARTICIPANT_SEPARATOR.to_string())))
    }

    /// Split a group reference into `(relay, group_id)`
    pub fn as_group(&self) -> Option<(&str, &str)> {
        self.0.split_once(GROUP_SEPARATOR)
    }

    /// Borrow the raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw key
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationRef {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ConversationRef {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for ConversationRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_reference() {
        let conv = ConversationRef::group("wss://relay1/", "group9");
        assert_eq!(conv.as_str(), "relay1'group9");
        assert_eq!(conv.as_group(), Some(("relay1", "group9")));
    }

    #[test]
    fn test_direct_reference_is_order_independent() {
        let a = ConversationRef::direct(["bbb", "aaa", "ccc"]).unwrap();
        let b = ConversationRef::direct(["ccc", "AAA", "bbb", "aaa"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "aaa,bbb,ccc");
    }

    #[test]
    fn test_empty_references_rejected() {
        assert!(ConversationRef::parse("  ").is_err());
        assert!(ConversationRef::direct(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let conv = ConversationRef::new("relay1'group9");
        assert_eq!(serde_json::to_string(&conv).unwrap(), "\"relay1'group9\"");
    }
}
