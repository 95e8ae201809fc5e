//! Two devices of one account syncing over a shared relay, each with its
//! own SQLite store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use relaycache_core::{ConversationRef, ReadMarker, StoredMessage, SyncConfig, Timestamp};
use relaycache_state::{query, LocalStore, SqliteStore};
use relaycache_sync::testing::{LoopbackIdentity, ManualClock, MemoryRelay};
use relaycache_sync::{SessionStatus, SyncEvent, SyncHandle, SyncService, SyncSession};

const NOW: Timestamp = 1_700_000_000;
const ME: &str = "npub-me";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaycache_sync=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn device(
    relay: &MemoryRelay,
    clock: Arc<ManualClock>,
) -> (SyncHandle, broadcast::Receiver<SyncEvent>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let session = SyncSession::new(ME, store.clone(), Arc::new(relay.clone()))
        .with_identity(Arc::new(LoopbackIdentity::new(ME)))
        .with_clock(clock)
        .with_config(SyncConfig {
            debounce: Duration::from_secs(3600),
            ..SyncConfig::default()
        });

    let (service, handle, mut events) = SyncService::new(session).unwrap();
    tokio::spawn(service.run());
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::StatusChanged { status: SessionStatus::Active })
    })
    .await;
    (handle, events, store)
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

fn chat(id: &str, conversation: &ConversationRef, created_at: Timestamp, pubkey: &str) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        conversation: conversation.clone(),
        kind: 9,
        created_at,
        pubkey: pubkey.to_string(),
        content: format!("message {id}"),
        tags: Vec::new(),
    }
}

#[tokio::test]
async fn test_read_state_follows_user_across_devices() {
    init_tracing();

    let relay = MemoryRelay::new();
    let laptop_clock = Arc::new(ManualClock::new(NOW));
    let phone_clock = Arc::new(ManualClock::new(NOW));
    let (laptop, _laptop_events, laptop_store) = device(&relay, laptop_clock.clone()).await;
    let (phone, mut phone_events, phone_store) = device(&relay, phone_clock.clone()).await;

    let general = ConversationRef::group("relay.example", "general");
    let history = [
        chat("a", &general, NOW - 300, "alice"),
        chat("b", &general, NOW - 200, "bob"),
        chat("c", &general, NOW - 100, "alice"),
    ];
    laptop_store.put_messages(&history).await.unwrap();
    phone_store.put_messages(&history).await.unwrap();
    assert_eq!(query::unread_count(phone_store.as_ref(), &general, Some(ME)).await.unwrap(), 3);

    // read up to bob's message on the laptop
    laptop
        .mark_read(ReadMarker::new(general.clone(), 9, NOW - 200).with_reference("e", "b"))
        .await
        .unwrap();
    assert!(laptop.flush().await.unwrap());

    wait_for(&mut phone_events, |e| matches!(e, SyncEvent::RemoteMerged { changed: 1, .. })).await;
    assert_eq!(query::unread_count(phone_store.as_ref(), &general, Some(ME)).await.unwrap(), 1);

    let marker = phone_store.get_marker(&general, 9).await.unwrap().unwrap();
    assert_eq!(marker.tag, "e");
    assert_eq!(marker.reference, "b");

    // the phone catches up and the laptop follows
    phone_clock.advance(10);
    phone
        .mark_read(ReadMarker::new(general.clone(), 9, NOW - 100))
        .await
        .unwrap();
    assert!(phone.flush().await.unwrap());

    let mut laptop_watch = query::watch(laptop_store.as_ref(), general.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while query::unread_count(laptop_store.as_ref(), &general, Some(ME)).await.unwrap() != 0 {
            laptop_watch.changed().await;
        }
    })
    .await
    .expect("laptop never caught up");

    let stats = laptop.stats().await.unwrap();
    assert_eq!(stats.publishes, 1);
    assert!(stats.echoes_skipped >= 1);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["publishes"], 1);

    laptop.logout().await.unwrap();
    phone.shutdown().await.unwrap();
    assert!(laptop_store.all_markers().await.unwrap().is_empty());
    assert_eq!(phone_store.all_markers().await.unwrap().len(), 1);
}
