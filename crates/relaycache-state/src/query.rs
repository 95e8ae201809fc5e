//! Conversation queries over the local store
//!
//! Everything here is a pure read. Unread counts use a half-open
//! `(baseline, +inf)` range so the message a marker points at is never
//! itself unread.

use std::cmp::Reverse;
use std::collections::HashMap;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

use relaycache_core::{ConversationRef, Kind, StoredMessage, Timestamp};

use crate::error::Result;
use crate::store::{LocalStore, MessageRange, StoreChange};

/// Newest message of a conversation
pub async fn last_message<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
) -> Result<Option<StoredMessage>> {
    let mut rows = store.scan_messages(conversation, &MessageRange::latest()).await?;
    Ok(rows.pop())
}

/// Newest message of a conversation written by `pubkey`
pub async fn last_message_by_author<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    pubkey: &str,
) -> Result<Option<StoredMessage>> {
    let range = MessageRange::latest().author(pubkey);
    let mut rows = store.scan_messages(conversation, &range).await?;
    Ok(rows.pop())
}

/// Number of messages strictly newer than `timestamp`, optionally
/// ignoring one author
pub async fn messages_after<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    timestamp: Timestamp,
    exclude_pubkey: Option<&str>,
) -> Result<u64> {
    store
        .count_messages(conversation, &MessageRange::after(timestamp), exclude_pubkey)
        .await
}

/// Number of messages strictly newer than `timestamp` that mention `pubkey`
pub async fn mentions_after<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    pubkey: &str,
    timestamp: Timestamp,
) -> Result<u64> {
    store.count_mentions(conversation, pubkey, timestamp).await
}

/// Unread messages in a conversation.
///
/// The baseline is the later of the newest read marker (across all kinds)
/// and the caller's own newest message. Own messages are never counted.
pub async fn unread_count<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    me: Option<&str>,
) -> Result<u64> {
    let marker = store
        .markers_for(conversation)
        .await?
        .into_iter()
        .map(|m| m.created_at)
        .max();

    count_since_baseline(store, conversation, None, marker, me).await
}

/// Unread messages of a single kind
pub async fn unread_count_for_kind<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    kind: Kind,
    me: Option<&str>,
) -> Result<u64> {
    let marker = store
        .get_marker(conversation, kind)
        .await?
        .map(|m| m.created_at);

    count_since_baseline(store, conversation, Some(kind), marker, me).await
}

/// Unread counts for several conversations
pub async fn unread_counts<S: LocalStore + ?Sized>(
    store: &S,
    conversations: &[ConversationRef],
    me: Option<&str>,
) -> Result<HashMap<ConversationRef, u64>> {
    let mut counts = HashMap::with_capacity(conversations.len());
    for conversation in conversations {
        let count = unread_count(store, conversation, me).await?;
        counts.insert(conversation.clone(), count);
    }
    Ok(counts)
}

async fn count_since_baseline<S: LocalStore + ?Sized>(
    store: &S,
    conversation: &ConversationRef,
    kind: Option<Kind>,
    marker: Option<Timestamp>,
    me: Option<&str>,
) -> Result<u64> {
    let own_last = match me {
        Some(pubkey) => {
            let mut range = MessageRange::latest().author(pubkey);
            range.kind = kind;
            store
                .scan_messages(conversation, &range)
                .await?
                .first()
                .map(|m| m.created_at)
        }
        None => None,
    };

    let baseline = marker.unwrap_or(0).max(own_last.unwrap_or(0));

    let mut range = MessageRange::after(baseline);
    range.kind = kind;
    let count = store.count_messages(conversation, &range, me).await?;

    trace!(%conversation, baseline, count, "Computed unread count");
    Ok(count)
}

/// Order conversations newest-activity first.
///
/// The sort is stable; conversations without messages sort last.
pub async fn sort_conversations_by_recency<S: LocalStore + ?Sized>(
    store: &S,
    conversations: Vec<ConversationRef>,
) -> Result<Vec<ConversationRef>> {
    let mut keyed = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let newest = last_message(store, &conversation)
            .await?
            .map(|m| m.created_at);
        keyed.push((newest, conversation));
    }

    keyed.sort_by_key(|(newest, _)| Reverse(*newest));
    Ok(keyed.into_iter().map(|(_, c)| c).collect())
}

/// Change notifications filtered to one conversation
pub struct ConversationWatch {
    conversation: ConversationRef,
    changes: broadcast::Receiver<StoreChange>,
}

impl ConversationWatch {
    /// The watched conversation
    pub fn conversation(&self) -> &ConversationRef {
        &self.conversation
    }

    /// Wait until something that can change this conversation's query
    /// results was written. Returns `false` once the store is gone.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.changes.recv().await {
                Ok(change) if change.affects(&self.conversation) => return true,
                Ok(_) => continue,
                // missed notifications may have touched us
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }
}

/// Watch a conversation for changes
pub fn watch<S: LocalStore + ?Sized>(store: &S, conversation: ConversationRef) -> ConversationWatch {
    ConversationWatch {
        conversation,
        changes: store.subscribe_changes(),
    }
}
