//! In-memory local store
//!
//! B-tree backed; the message index is ordered by
//! `(conversation, created_at, id)` so a conversation's range is one
//! contiguous scan. Nothing survives the process.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tokio::sync::broadcast;

use relaycache_core::{
    ConversationRef, Kind, MarkerKey, ReadMarker, StoredMessage, SyncMeta, Timestamp,
};

use crate::error::Result;
use crate::store::{LocalStore, MessageRange, Order, StoreChange};

type IndexKey = (ConversationRef, Timestamp, String);

#[derive(Default)]
struct Tables {
    messages: HashMap<String, StoredMessage>,
    by_conversation: BTreeSet<IndexKey>,
    markers: BTreeMap<MarkerKey, ReadMarker>,
    meta: Option<SyncMeta>,
}

impl Tables {
    fn insert(&mut self, message: &StoredMessage) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        self.by_conversation.insert((
            message.conversation.clone(),
            message.created_at,
            message.id.clone(),
        ));
        self.messages.insert(message.id.clone(), message.clone());
        true
    }

    /// Messages of one conversation in `(created_at, id)` order
    fn conversation<'a>(
        &'a self,
        conversation: &'a ConversationRef,
    ) -> impl Iterator<Item = &'a StoredMessage> + 'a {
        let start = (conversation.clone(), Timestamp::MIN, String::new());
        self.by_conversation
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(move |(c, _, _)| c == conversation)
            .filter_map(|(_, _, id)| self.messages.get(id))
    }
}

fn in_range(message: &StoredMessage, range: &MessageRange) -> bool {
    range.contains(message.created_at)
        && range.kind.map_or(true, |k| k == message.kind)
        && range.author.as_deref().map_or(true, |a| a == message.pubkey)
}

/// Process-local implementation of [`LocalStore`]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
        }
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn put_message(&self, message: &StoredMessage) -> Result<bool> {
        let inserted = self.tables.write().insert(message);
        if inserted {
            self.notify(StoreChange::MessagesAdded {
                conversation: message.conversation.clone(),
                count: 1,
            });
        }
        Ok(inserted)
    }

    async fn put_messages(&self, messages: &[StoredMessage]) -> Result<usize> {
        let mut added: Vec<(ConversationRef, usize)> = Vec::new();
        {
            let mut tables = self.tables.write();
            for message in messages {
                if tables.insert(message) {
                    match added.iter_mut().find(|(c, _)| c == &message.conversation) {
                        Some((_, count)) => *count += 1,
                        None => added.push((message.conversation.clone(), 1)),
                    }
                }
            }
        }

        let total = added.iter().map(|(_, n)| n).sum();
        for (conversation, count) in added {
            self.notify(StoreChange::MessagesAdded { conversation, count });
        }
        Ok(total)
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        Ok(self.tables.read().messages.get(id).cloned())
    }

    async fn scan_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
    ) -> Result<Vec<StoredMessage>> {
        let tables = self.tables.read();
        let matching = tables.conversation(conversation).filter(|m| in_range(m, range));

        let mut rows: Vec<StoredMessage> = match range.order {
            Order::Ascending => matching.cloned().collect(),
            Order::Descending => {
                let mut rows: Vec<StoredMessage> = matching.cloned().collect();
                rows.reverse();
                rows
            }
        };
        if let Some(limit) = range.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn count_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
        exclude_author: Option<&str>,
    ) -> Result<u64> {
        let tables = self.tables.read();
        let count = tables
            .conversation(conversation)
            .filter(|m| in_range(m, range))
            .filter(|m| exclude_author.map_or(true, |a| a != m.pubkey))
            .count();
        Ok(count as u64)
    }

    async fn count_mentions(
        &self,
        conversation: &ConversationRef,
        pubkey: &str,
        after: Timestamp,
    ) -> Result<u64> {
        let tables = self.tables.read();
        let count = tables
            .conversation(conversation)
            .filter(|m| m.created_at > after && m.mentions_pubkey(pubkey))
            .count();
        Ok(count as u64)
    }

    async fn put_marker(&self, marker: &ReadMarker) -> Result<()> {
        self.tables.write().markers.insert(marker.key(), marker.clone());
        self.notify(StoreChange::MarkerChanged {
            conversation: marker.conversation.clone(),
            kind: marker.kind,
        });
        Ok(())
    }

    async fn advance_marker(&self, marker: &ReadMarker) -> Result<bool> {
        let changed = {
            let mut tables = self.tables.write();
            match tables.markers.get(&marker.key()) {
                Some(current) if !marker.supersedes(current) => false,
                _ => {
                    tables.markers.insert(marker.key(), marker.clone());
                    true
                }
            }
        };
        if changed {
            self.notify(StoreChange::MarkerChanged {
                conversation: marker.conversation.clone(),
                kind: marker.kind,
            });
        }
        Ok(changed)
    }

    async fn get_marker(
        &self,
        conversation: &ConversationRef,
        kind: Kind,
    ) -> Result<Option<ReadMarker>> {
        let key = (conversation.clone(), kind);
        Ok(self.tables.read().markers.get(&key).cloned())
    }

    async fn markers_for(&self, conversation: &ConversationRef) -> Result<Vec<ReadMarker>> {
        Ok(self
            .tables
            .read()
            .markers
            .range((conversation.clone(), Kind::MIN)..=(conversation.clone(), Kind::MAX))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn all_markers(&self) -> Result<Vec<ReadMarker>> {
        Ok(self.tables.read().markers.values().cloned().collect())
    }

    async fn replace_markers(&self, markers: &[ReadMarker], meta: Option<SyncMeta>) -> Result<()> {
        {
            let mut tables = self.tables.write();
            tables.markers = markers.iter().map(|m| (m.key(), m.clone())).collect();
            if meta.is_some() {
                tables.meta = meta;
            }
        }
        self.notify(StoreChange::MarkersReplaced {
            count: markers.len(),
        });
        Ok(())
    }

    async fn prune_markers(&self, cutoff: Timestamp) -> Result<u64> {
        let pruned = {
            let mut tables = self.tables.write();
            let before = tables.markers.len();
            tables.markers.retain(|_, m| m.created_at >= cutoff);
            (before - tables.markers.len()) as u64
        };
        if pruned > 0 {
            self.notify(StoreChange::MarkersPruned { count: pruned });
        }
        Ok(pruned)
    }

    async fn sync_meta(&self) -> Result<SyncMeta> {
        Ok(self.tables.read().meta.unwrap_or_default())
    }

    async fn set_sync_meta(&self, meta: SyncMeta) -> Result<()> {
        self.tables.write().meta = Some(meta);
        Ok(())
    }

    async fn clear_read_state(&self) -> Result<()> {
        {
            let mut tables = self.tables.write();
            tables.markers.clear();
            tables.meta = None;
        }
        self.notify(StoreChange::ReadStateCleared);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
