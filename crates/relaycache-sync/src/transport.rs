//! Relay transport interface
//!
//! The orchestrator only needs three relay operations: open a live
//! subscription, fetch the newest stored event matching a filter, and
//! publish a signed event.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use relaycache_core::{Filter, RelayMessage, SignedEvent};

use crate::error::{SyncError, TransportError};

/// A live relay subscription
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<RelayMessage>,
}

impl Subscription {
    /// Wrap a channel fed by the transport
    pub fn new(messages: mpsc::Receiver<RelayMessage>) -> Self {
        Self { messages }
    }

    /// Create a subscription and the sender that feeds it
    pub fn channel(buffer: usize) -> (mpsc::Sender<RelayMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    /// Next message, or `None` once the relay closed the subscription
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.messages.recv().await
    }
}

/// Relay operations consumed by the sync service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a live subscription; stored events are delivered first,
    /// followed by [`RelayMessage::EndOfStoredEvents`]
    async fn subscribe(&self, filter: Filter) -> Result<Subscription, TransportError>;

    /// Newest stored event matching `filter`
    async fn fetch_latest(&self, filter: Filter) -> Result<Option<SignedEvent>, TransportError>;

    /// Publish a signed event
    async fn publish(&self, event: SignedEvent) -> Result<(), TransportError>;
}

/// Outcome of fetching the latest remote event
#[derive(Debug)]
pub enum FetchResult {
    /// The relay returned an event
    Found(SignedEvent),
    /// The relay has no matching event yet
    Empty,
    /// The fetch failed or timed out
    Failed(SyncError),
}

impl FetchResult {
    /// Whether the fetch ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchResult::Failed(SyncError::Timeout { .. }))
    }
}

/// Fetch the newest matching event, bounded by `timeout`
pub async fn fetch_latest<T: Transport + ?Sized>(
    transport: &T,
    filter: Filter,
    timeout: Duration,
) -> FetchResult {
    match tokio::time::timeout(timeout, transport.fetch_latest(filter)).await {
        Ok(Ok(Some(event))) => FetchResult::Found(event),
        Ok(Ok(None)) => FetchResult::Empty,
        Ok(Err(e)) => FetchResult::Failed(SyncError::Transport(e)),
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "Fetch timed out");
            FetchResult::Failed(SyncError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}
