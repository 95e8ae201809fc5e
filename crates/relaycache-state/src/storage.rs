//! SQLite-backed local store
//!
//! Compound indexes on `messages` serve the conversation range scans;
//! `message_mentions` emulates a multi-entry index over `p` tags so
//! mention counts never have to parse tag JSON.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::ops::Bound;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use relaycache_core::{
    ConversationRef, Kind, ReadMarker, StorageConfig, StoredMessage, SyncMeta, Timestamp,
};

use crate::error::{Result, StateError};
use crate::store::{LocalStore, MessageRange, Order, StoreChange};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY NOT NULL,
        conversation TEXT NOT NULL,
        kind INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        pubkey TEXT NOT NULL,
        content TEXT NOT NULL,
        tags TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created ON messages (conversation, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_kind_created ON messages (conversation, kind, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_pubkey_created ON messages (conversation, pubkey, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS message_mentions (
        message_id TEXT NOT NULL,
        pubkey TEXT NOT NULL,
        conversation TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, pubkey)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mentions_conversation_pubkey_created ON message_mentions (conversation, pubkey, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS read_markers (
        conversation TEXT NOT NULL,
        kind INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        tag TEXT NOT NULL DEFAULT '',
        reference TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (conversation, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_meta (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        last_published INTEGER NOT NULL,
        last_processed INTEGER NOT NULL
    )
    "#,
];

const MESSAGE_COLUMNS: &str = "id, conversation, kind, created_at, pubkey, content, tags";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation: String,
    kind: i64,
    created_at: i64,
    pubkey: String,
    content: String,
    tags: String,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StateError;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(StoredMessage {
            kind: kind_from_column(row.kind)?,
            tags: serde_json::from_str(&row.tags)?,
            id: row.id,
            conversation: ConversationRef::new(row.conversation),
            created_at: row.created_at,
            pubkey: row.pubkey,
            content: row.content,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MarkerRow {
    conversation: String,
    kind: i64,
    created_at: i64,
    tag: String,
    reference: String,
}

impl TryFrom<MarkerRow> for ReadMarker {
    type Error = StateError;

    fn try_from(row: MarkerRow) -> Result<Self> {
        Ok(ReadMarker {
            conversation: ConversationRef::new(row.conversation),
            kind: kind_from_column(row.kind)?,
            created_at: row.created_at,
            tag: row.tag,
            reference: row.reference,
        })
    }
}

fn kind_from_column(kind: i64) -> Result<Kind> {
    Kind::try_from(kind).map_err(|_| StateError::InvalidData(format!("kind {kind} out of range")))
}

/// SQLite implementation of [`LocalStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url`
    pub async fn new(url: &str) -> Result<Self> {
        Self::open(&StorageConfig {
            database_url: url.to_string(),
            ..StorageConfig::default()
        })
        .await
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StorageConfig::in_memory()).await
    }

    /// Open with explicit configuration
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.database_url.contains(":memory:") {
            // the database lives only as long as its connection
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StateError::Schema(e.to_string()))?;
        }

        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        info!(url = %config.database_url, "Local store opened");

        Ok(Self { pool, changes })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn notify(&self, change: StoreChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }
}

async fn insert_message(conn: &mut SqliteConnection, message: &StoredMessage) -> Result<bool> {
    let tags = serde_json::to_string(&message.tags)?;
    let result = sqlx::query(
        r#"
        INSERT INTO messages (id, conversation, kind, created_at, pubkey, content, tags)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(message.conversation.as_str())
    .bind(i64::from(message.kind))
    .bind(message.created_at)
    .bind(&message.pubkey)
    .bind(&message.content)
    .bind(&tags)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    for pubkey in message.mentions() {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_mentions (message_id, pubkey, conversation, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(pubkey)
        .bind(message.conversation.as_str())
        .bind(message.created_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(true)
}

async fn insert_marker(conn: &mut SqliteConnection, marker: &ReadMarker) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO read_markers (conversation, kind, created_at, tag, reference)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(conversation, kind) DO UPDATE SET
            created_at = excluded.created_at,
            tag = excluded.tag,
            reference = excluded.reference
        "#,
    )
    .bind(marker.conversation.as_str())
    .bind(i64::from(marker.kind))
    .bind(marker.created_at)
    .bind(&marker.tag)
    .bind(&marker.reference)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_sync_meta(conn: &mut SqliteConnection, meta: SyncMeta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_meta (id, last_published, last_processed)
        VALUES (0, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            last_published = excluded.last_published,
            last_processed = excluded.last_processed
        "#,
    )
    .bind(meta.last_published)
    .bind(meta.last_processed)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn push_range(
    qb: &mut QueryBuilder<'_, Sqlite>,
    conversation: &ConversationRef,
    range: &MessageRange,
    exclude_author: Option<&str>,
) {
    qb.push(" WHERE conversation = ")
        .push_bind(conversation.as_str().to_owned());

    if let Some(kind) = range.kind {
        qb.push(" AND kind = ").push_bind(i64::from(kind));
    }
    if let Some(ref author) = range.author {
        qb.push(" AND pubkey = ").push_bind(author.clone());
    }
    if let Some(excluded) = exclude_author {
        qb.push(" AND pubkey != ").push_bind(excluded.to_owned());
    }

    match range.lower {
        Bound::Included(ts) => {
            qb.push(" AND created_at >= ").push_bind(ts);
        }
        Bound::Excluded(ts) => {
            qb.push(" AND created_at > ").push_bind(ts);
        }
        Bound::Unbounded => {}
    }
    match range.upper {
        Bound::Included(ts) => {
            qb.push(" AND created_at <= ").push_bind(ts);
        }
        Bound::Excluded(ts) => {
            qb.push(" AND created_at < ").push_bind(ts);
        }
        Bound::Unbounded => {}
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put_message(&self, message: &StoredMessage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_message(&mut tx, message).await?;
        tx.commit().await?;

        if inserted {
            trace!(id = %message.id, conversation = %message.conversation, "Stored message");
            self.notify(StoreChange::MessagesAdded {
                conversation: message.conversation.clone(),
                count: 1,
            });
        }
        Ok(inserted)
    }

    async fn put_messages(&self, messages: &[StoredMessage]) -> Result<usize> {
        let mut added: Vec<(ConversationRef, usize)> = Vec::new();

        let mut tx = self.pool.begin().await?;
        for message in messages {
            if insert_message(&mut tx, message).await? {
                match added.iter_mut().find(|(c, _)| c == &message.conversation) {
                    Some((_, count)) => *count += 1,
                    None => added.push((message.conversation.clone(), 1)),
                }
            }
        }
        tx.commit().await?;

        let total = added.iter().map(|(_, n)| n).sum();
        debug!(received = messages.len(), inserted = total, "Stored message batch");
        for (conversation, count) in added {
            self.notify(StoreChange::MessagesAdded { conversation, count });
        }
        Ok(total)
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredMessage::try_from).transpose()
    }

    async fn scan_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
    ) -> Result<Vec<StoredMessage>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages"));
        push_range(&mut qb, conversation, range, None);

        qb.push(match range.order {
            Order::Ascending => " ORDER BY created_at ASC, id ASC",
            Order::Descending => " ORDER BY created_at DESC, id DESC",
        });
        if let Some(limit) = range.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build_query_as::<MessageRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn count_messages(
        &self,
        conversation: &ConversationRef,
        range: &MessageRange,
        exclude_author: Option<&str>,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM messages");
        push_range(&mut qb, conversation, range, exclude_author);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn count_mentions(
        &self,
        conversation: &ConversationRef,
        pubkey: &str,
        after: Timestamp,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM message_mentions
            WHERE conversation = ? AND pubkey = ? AND created_at > ?
            "#,
        )
        .bind(conversation.as_str())
        .bind(pubkey)
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn put_marker(&self, marker: &ReadMarker) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_marker(&mut conn, marker).await?;
        drop(conn);

        self.notify(StoreChange::MarkerChanged {
            conversation: marker.conversation.clone(),
            kind: marker.kind,
        });
        Ok(())
    }

    async fn advance_marker(&self, marker: &ReadMarker) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO read_markers (conversation, kind, created_at, tag, reference)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(conversation, kind) DO UPDATE SET
                created_at = excluded.created_at,
                tag = excluded.tag,
                reference = excluded.reference
            WHERE excluded.created_at > read_markers.created_at
            "#,
        )
        .bind(marker.conversation.as_str())
        .bind(i64::from(marker.kind))
        .bind(marker.created_at)
        .bind(&marker.tag)
        .bind(&marker.reference)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
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
        let row = sqlx::query_as::<_, MarkerRow>(
            r#"
            SELECT conversation, kind, created_at, tag, reference
            FROM read_markers
            WHERE conversation = ? AND kind = ?
            "#,
        )
        .bind(conversation.as_str())
        .bind(i64::from(kind))
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReadMarker::try_from).transpose()
    }

    async fn markers_for(&self, conversation: &ConversationRef) -> Result<Vec<ReadMarker>> {
        let rows = sqlx::query_as::<_, MarkerRow>(
            r#"
            SELECT conversation, kind, created_at, tag, reference
            FROM read_markers
            WHERE conversation = ?
            ORDER BY kind ASC
            "#,
        )
        .bind(conversation.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadMarker::try_from).collect()
    }

    async fn all_markers(&self) -> Result<Vec<ReadMarker>> {
        let rows = sqlx::query_as::<_, MarkerRow>(
            r#"
            SELECT conversation, kind, created_at, tag, reference
            FROM read_markers
            ORDER BY conversation ASC, kind ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadMarker::try_from).collect()
    }

    async fn replace_markers(&self, markers: &[ReadMarker], meta: Option<SyncMeta>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM read_markers")
            .execute(&mut *tx)
            .await?;
        for marker in markers {
            insert_marker(&mut tx, marker).await?;
        }
        if let Some(meta) = meta {
            write_sync_meta(&mut tx, meta).await?;
        }

        tx.commit().await?;

        debug!(count = markers.len(), meta = ?meta, "Replaced read markers");
        self.notify(StoreChange::MarkersReplaced {
            count: markers.len(),
        });
        Ok(())
    }

    async fn prune_markers(&self, cutoff: Timestamp) -> Result<u64> {
        let result = sqlx::query("DELETE FROM read_markers WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(pruned, cutoff, "Pruned read markers");
            self.notify(StoreChange::MarkersPruned { count: pruned });
        }
        Ok(pruned)
    }

    async fn sync_meta(&self) -> Result<SyncMeta> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT last_published, last_processed FROM sync_meta WHERE id = 0")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(last_published, last_processed)| SyncMeta {
                last_published,
                last_processed,
            })
            .unwrap_or_default())
    }

    async fn set_sync_meta(&self, meta: SyncMeta) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_sync_meta(&mut conn, meta).await
    }

    async fn clear_read_state(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM read_markers")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_meta")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Cleared read state");
        self.notify(StoreChange::ReadStateCleared);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, conversation: &str, kind: Kind, created_at: i64, pubkey: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            conversation: ConversationRef::new(conversation),
            kind,
            created_at,
            pubkey: pubkey.to_string(),
            content: format!("message {id}"),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_put_message_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let msg = message("m1", "c", 9, 100, "alice");

        assert!(store.put_message(&msg).await.unwrap());
        assert!(!store.put_message(&msg).await.unwrap());

        let count = store
            .count_messages(&msg.conversation, &MessageRange::all(), None)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get_message("m1").await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn test_scan_bounds_and_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let conv = ConversationRef::new("c");
        store
            .put_messages(&[
                message("a", "c", 9, 10, "alice"),
                message("b", "c", 9, 20, "bob"),
                message("d", "c", 7, 30, "bob"),
                message("e", "other", 9, 25, "bob"),
            ])
            .await
            .unwrap();

        let ids = |msgs: Vec<StoredMessage>| msgs.into_iter().map(|m| m.id).collect::<Vec<_>>();

        let all = store.scan_messages(&conv, &MessageRange::all()).await.unwrap();
        assert_eq!(ids(all), vec!["a", "b", "d"]);

        let desc = store
            .scan_messages(&conv, &MessageRange::all().descending())
            .await
            .unwrap();
        assert_eq!(ids(desc), vec!["d", "b", "a"]);

        let closed = store
            .scan_messages(
                &conv,
                &MessageRange::all()
                    .lower(Bound::Included(10))
                    .upper(Bound::Excluded(30)),
            )
            .await
            .unwrap();
        assert_eq!(ids(closed), vec!["a", "b"]);

        let by_kind = store
            .scan_messages(&conv, &MessageRange::after(10).kind(9))
            .await
            .unwrap();
        assert_eq!(ids(by_kind), vec!["b"]);
    }

    #[tokio::test]
    async fn test_advance_marker_only_moves_forward() {
        let store = SqliteStore::in_memory().await.unwrap();
        let conv = ConversationRef::new("c");

        assert!(store.advance_marker(&ReadMarker::new("c", 9, 100)).await.unwrap());
        assert!(!store.advance_marker(&ReadMarker::new("c", 9, 90)).await.unwrap());
        assert!(!store.advance_marker(&ReadMarker::new("c", 9, 100)).await.unwrap());
        assert!(store.advance_marker(&ReadMarker::new("c", 9, 110)).await.unwrap());

        let marker = store.get_marker(&conv, 9).await.unwrap().unwrap();
        assert_eq!(marker.created_at, 110);

        // plain put overwrites unconditionally
        store.put_marker(&ReadMarker::new("c", 9, 50)).await.unwrap();
        let marker = store.get_marker(&conv, 9).await.unwrap().unwrap();
        assert_eq!(marker.created_at, 50);
    }

    #[tokio::test]
    async fn test_replace_markers_is_atomic_with_meta() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_marker(&ReadMarker::new("old", 9, 1)).await.unwrap();

        let mut changes = store.subscribe_changes();
        let markers = vec![ReadMarker::new("a", 9, 10), ReadMarker::new("b", 9, 20)];
        let meta = SyncMeta {
            last_published: 0,
            last_processed: 500,
        };
        store.replace_markers(&markers, Some(meta)).await.unwrap();

        let stored = store.all_markers().await.unwrap();
        assert_eq!(stored, markers);
        assert_eq!(store.sync_meta().await.unwrap(), meta);
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::MarkersReplaced { count: 2 }
        );
    }

    #[tokio::test]
    async fn test_prune_markers_below_cutoff() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_marker(&ReadMarker::new("a", 9, 100)).await.unwrap();
        store.put_marker(&ReadMarker::new("b", 9, 200)).await.unwrap();

        assert_eq!(store.prune_markers(200).await.unwrap(), 1);
        let remaining = store.all_markers().await.unwrap();
        assert_eq!(remaining, vec![ReadMarker::new("b", 9, 200)]);
    }

    #[tokio::test]
    async fn test_sync_meta_defaults_to_zero() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.sync_meta().await.unwrap(), SyncMeta::default());

        let meta = SyncMeta::default().published(42);
        store.set_sync_meta(meta).await.unwrap();
        assert_eq!(store.sync_meta().await.unwrap(), meta);

        store.clear_read_state().await.unwrap();
        assert_eq!(store.sync_meta().await.unwrap(), SyncMeta::default());
    }
}
