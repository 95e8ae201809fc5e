//! On-disk store behaviour across reopen

use relaycache_core::{ConversationRef, ReadMarker, StorageConfig, StoredMessage, SyncMeta};
use relaycache_state::{merge, query, LocalStore, SqliteStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaycache_state=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

fn config(dir: &tempfile::TempDir) -> StorageConfig {
    StorageConfig {
        database_url: format!("sqlite:{}?mode=rwc", dir.path().join("cache.db").display()),
        ..StorageConfig::default()
    }
}

fn message(id: &str, created_at: i64, pubkey: &str) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        conversation: ConversationRef::group("wss://relay1/", "group9"),
        kind: 9,
        created_at,
        pubkey: pubkey.to_string(),
        content: format!("hello from {pubkey}"),
        tags: vec![vec!["p".to_string(), "me".to_string()]],
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let conversation = ConversationRef::group("relay1", "group9");

    {
        let store = SqliteStore::open(&config(&dir)).await.unwrap();
        let added = store
            .put_messages(&[message("a", 100, "other"), message("b", 200, "other")])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let merged = merge(
            &[ReadMarker::new(conversation.clone(), 9, 100)],
            &[ReadMarker::new(conversation.clone(), 9, 150)],
        );
        store
            .replace_markers(&merged, Some(SyncMeta::default().published(1_700_000_000)))
            .await
            .unwrap();
        store.close().await;
    }

    let store = SqliteStore::open(&config(&dir)).await.unwrap();
    assert_eq!(
        store.get_marker(&conversation, 9).await.unwrap().map(|m| m.created_at),
        Some(150)
    );
    assert_eq!(store.sync_meta().await.unwrap().last_published, 1_700_000_000);
    assert_eq!(query::unread_count(&store, &conversation, Some("me")).await.unwrap(), 1);
    assert_eq!(
        query::mentions_after(&store, &conversation, "me", 150).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_concurrent_writers_share_one_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&config(&dir)).await.unwrap();
    let conversation = ConversationRef::group("relay1", "group9");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .put_message(&message(&format!("m{i}"), 100 + i, "other"))
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    let last = query::last_message(&store, &conversation).await.unwrap().unwrap();
    assert_eq!(last.id, "m7");
    assert_eq!(query::messages_after(&store, &conversation, 103, None).await.unwrap(), 4);
}
