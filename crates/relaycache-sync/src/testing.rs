//! In-process doubles for relays, signers and clocks

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use relaycache_core::event::is_replaceable;
use relaycache_core::{
    Clock, Filter, Identity, IdentityError, RelayMessage, SignedEvent, Timestamp, UnsignedEvent,
};

use crate::error::TransportError;
use crate::transport::{Subscription, Transport};

#[derive(Default)]
struct RelayState {
    stored: Vec<SignedEvent>,
    published: Vec<SignedEvent>,
    subscribers: Vec<(Filter, mpsc::Sender<RelayMessage>)>,
    fetch_failure: bool,
    publish_failure: bool,
    fetch_delay: Option<Duration>,
    fetches: usize,
}

impl RelayState {
    /// Store with replaceable semantics and fan out to live subscribers
    fn accept(&mut self, event: SignedEvent) {
        if is_replaceable(event.kind) {
            let newer_exists = self.stored.iter().any(|e| {
                e.kind == event.kind && e.pubkey == event.pubkey && e.created_at >= event.created_at
            });
            if newer_exists {
                return;
            }
            self.stored
                .retain(|e| !(e.kind == event.kind && e.pubkey == event.pubkey));
        }

        self.subscribers.retain(|(filter, tx)| {
            if filter.matches(&event) {
                tx.try_send(RelayMessage::Event(event.clone())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        self.stored.push(event);
    }
}

/// A relay held in memory, shared between clones
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event as if another client had published it
    pub fn inject(&self, event: SignedEvent) {
        self.state.lock().accept(event);
    }

    /// Every event published through [`Transport::publish`]
    pub fn published(&self) -> Vec<SignedEvent> {
        self.state.lock().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.state.lock().published.len()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    /// Newest stored event of a kind
    pub fn latest(&self, kind: u32) -> Option<SignedEvent> {
        self.state
            .lock()
            .stored
            .iter()
            .filter(|e| e.kind == kind)
            .max_by_key(|e| e.created_at)
            .cloned()
    }

    pub fn set_fetch_failure(&self, fail: bool) {
        self.state.lock().fetch_failure = fail;
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.state.lock().publish_failure = fail;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().fetch_delay = delay;
    }

    /// Drop every live subscription
    pub fn close_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn subscribe(&self, filter: Filter) -> Result<Subscription, TransportError> {
        let (tx, subscription) = Subscription::channel(64);

        let mut state = self.state.lock();
        let mut backlog: Vec<&SignedEvent> =
            state.stored.iter().filter(|e| filter.matches(e)).collect();
        backlog.sort_by_key(|e| e.created_at);
        for event in backlog {
            tx.try_send(RelayMessage::Event(event.clone()))
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        tx.try_send(RelayMessage::EndOfStoredEvents)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        state.subscribers.push((filter, tx));
        Ok(subscription)
    }

    async fn fetch_latest(&self, filter: Filter) -> Result<Option<SignedEvent>, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.fetches += 1;
            if state.fetch_failure {
                return Err(TransportError::Connection("relay unreachable".into()));
            }
            state.fetch_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .state
            .lock()
            .stored
            .iter()
            .filter(|e| filter.matches(e))
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn publish(&self, event: SignedEvent) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.publish_failure {
            return Err(TransportError::Rejected("publish refused".into()));
        }
        state.published.push(event.clone());
        state.accept(event);
        Ok(())
    }
}

/// Signer whose "encryption" is readable only by the same public key.
///
/// Not cryptography; it only makes ciphertext opaque to other identities
/// and malformed input detectable.
pub struct LoopbackIdentity {
    pubkey: String,
    available: AtomicBool,
}

impl LoopbackIdentity {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the signer being detached
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn prefix(&self) -> String {
        format!("loopback:{}:", self.pubkey)
    }

    fn check(&self) -> Result<(), IdentityError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IdentityError::Unavailable)
        }
    }
}

#[async_trait]
impl Identity for LoopbackIdentity {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign(&self, event: UnsignedEvent) -> Result<SignedEvent, IdentityError> {
        self.check()?;
        if event.pubkey != self.pubkey {
            return Err(IdentityError::Sign(format!(
                "cannot sign for {}",
                event.pubkey
            )));
        }
        let sig = format!("sig:{}", event.id());
        Ok(event.into_signed(sig))
    }

    async fn encrypt_to_self(&self, plaintext: &str) -> Result<String, IdentityError> {
        self.check()?;
        let reversed: String = plaintext.chars().rev().collect();
        Ok(format!("{}{}", self.prefix(), reversed))
    }

    async fn decrypt_from_self(&self, ciphertext: &str) -> Result<String, IdentityError> {
        self.check()?;
        ciphertext
            .strip_prefix(&self.prefix())
            .map(|body| body.chars().rev().collect())
            .ok_or_else(|| IdentityError::Decrypt("not encrypted to this key".into()))
    }
}

/// Clock set by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
