//! Sync service - read-state replication for one account session
//!
//! The SyncService owns the live relay subscription and the debounce
//! deadline, and serializes every read-merge-write of the marker table
//! (remote intake, publish, local mark-read) through one task.

use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relaycache_core::{
    Clock, Filter, Identity, ReadMarker, RelayMessage, SignedEvent, SyncConfig, SystemClock,
    Timestamp, UnsignedEvent,
};
use relaycache_state::merge::{count_changes, merge, prune};
use relaycache_state::{codec, DecodeReport, LocalStore, StateError};

use crate::error::{Result, SyncError};
use crate::event::{SessionStatus, SyncEvent, SyncStats};
use crate::transport::{self, FetchResult, Subscription, Transport};

/// Everything a sync session needs, scoped to one signed-in account
#[derive(Clone)]
pub struct SyncSession {
    /// Hex public key of the signed-in user
    pub pubkey: String,
    pub store: Arc<dyn LocalStore>,
    pub transport: Arc<dyn Transport>,
    /// Signer; `None` runs the session local-only
    pub identity: Option<Arc<dyn Identity>>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

impl SyncSession {
    /// Session without a signer, using the system clock and default config
    pub fn new(
        pubkey: impl Into<String>,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            store,
            transport,
            identity: None,
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }
}

/// Commands sent to the sync service
#[derive(Debug)]
pub enum SyncCommand {
    /// Advance a marker and schedule a publish
    MarkRead {
        marker: ReadMarker,
        response: oneshot::Sender<Result<bool>>,
    },
    /// Publish now if a publish is pending
    Flush {
        response: oneshot::Sender<Result<bool>>,
    },
    /// Get sync stats
    GetStats { response: oneshot::Sender<SyncStats> },
    /// Tear the session down
    Shutdown {
        reset_local_state: bool,
        response: Option<oneshot::Sender<Result<()>>>,
    },
}

/// Handle for interacting with the sync service
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    status: Arc<RwLock<SessionStatus>>,
    closed: Arc<AtomicBool>,
    pubkey: String,
}

impl SyncHandle {
    /// Public key of the session
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Current session state
    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    /// Whether shutdown has been requested
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record that the user has seen a conversation up to
    /// `marker.created_at`. Returns whether the local marker moved.
    pub async fn mark_read(&self, marker: ReadMarker) -> Result<bool> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::MarkRead {
                marker,
                response: tx,
            })
            .await
            .map_err(|_| SyncError::Channel("Failed to send mark_read command".into()))?;

        rx.await
            .map_err(|_| SyncError::Channel("Failed to receive mark_read result".into()))?
    }

    /// Publish a pending update immediately. Returns whether anything
    /// was published.
    pub async fn flush(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::Flush { response: tx })
            .await
            .map_err(|_| SyncError::Channel("Failed to send flush command".into()))?;

        rx.await
            .map_err(|_| SyncError::Channel("Failed to receive flush result".into()))?
    }

    /// Get sync statistics
    pub async fn stats(&self) -> Result<SyncStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::GetStats { response: tx })
            .await
            .map_err(|_| SyncError::Channel("Failed to send get_stats command".into()))?;

        rx.await
            .map_err(|_| SyncError::Channel("Failed to receive stats".into()))
    }

    /// Stop syncing. Pending publishes are discarded.
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.command_tx
            .send(SyncCommand::Shutdown {
                reset_local_state: false,
                response: None,
            })
            .await
            .map_err(|_| SyncError::Channel("Failed to send shutdown command".into()))
    }

    /// Stop syncing and wipe read markers and sync bookkeeping
    pub async fn logout(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::Shutdown {
                reset_local_state: true,
                response: Some(tx),
            })
            .await
            .map_err(|_| SyncError::Channel("Failed to send logout command".into()))?;

        rx.await
            .map_err(|_| SyncError::Channel("Failed to receive logout result".into()))?
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SyncHandle {
    /// Handle wired to a bare command channel, for testing callers
    pub fn mock(pubkey: impl Into<String>) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let handle = Self {
            command_tx,
            status: Arc::new(RwLock::new(SessionStatus::Idle)),
            closed: Arc::new(AtomicBool::new(false)),
            pubkey: pubkey.into(),
        };
        (handle, command_rx)
    }
}

/// What intake did with a remote event
#[derive(Debug, Clone, PartialEq, Eq)]
enum IntakeOutcome {
    Merged {
        entries: usize,
        dropped: usize,
        changed: usize,
    },
    Echo,
    Stale,
    Rejected(String),
}

/// The sync service drives one account session
pub struct SyncService {
    /// Session context
    session: SyncSession,
    /// Signer; cleared when the session degrades to local-only
    identity: Option<Arc<dyn Identity>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<SyncEvent>,
    /// Command receiver
    command_rx: mpsc::Receiver<SyncCommand>,
    /// Live relay subscription
    subscription: Option<Subscription>,
    /// Re-open the subscription after the next successful publish
    resubscribe: bool,
    /// When the debounced publish fires
    publish_at: Option<Instant>,
    /// Decoded remote payloads by event id
    decoded: LruCache<String, Vec<ReadMarker>>,
    status: Arc<RwLock<SessionStatus>>,
    stats: Arc<RwLock<SyncStats>>,
    closed: Arc<AtomicBool>,
    start_time: StdInstant,
}

impl SyncService {
    /// Create a new sync service
    pub fn new(
        session: SyncSession,
    ) -> Result<(Self, SyncHandle, broadcast::Receiver<SyncEvent>)> {
        session.config.validate()?;

        let (event_tx, event_rx) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let status = Arc::new(RwLock::new(SessionStatus::Idle));
        let closed = Arc::new(AtomicBool::new(false));

        let handle = SyncHandle {
            command_tx,
            status: status.clone(),
            closed: closed.clone(),
            pubkey: session.pubkey.clone(),
        };

        let cache_size =
            NonZeroUsize::new(session.config.decode_cache_size).unwrap_or(NonZeroUsize::MIN);

        let service = Self {
            identity: session.identity.clone(),
            session,
            event_tx,
            command_rx,
            subscription: None,
            resubscribe: false,
            publish_at: None,
            decoded: LruCache::new(cache_size),
            status,
            stats: Arc::new(RwLock::new(SyncStats::default())),
            closed,
            start_time: StdInstant::now(),
        };

        Ok((service, handle, event_rx))
    }

    /// Run the session until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        info!(pubkey = %self.session.pubkey, "Starting read-state sync");

        match self.activate().await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => debug!("Session closed during activation"),
            Err(e) if e.is_identity_unavailable() => self.degrade(e.to_string()),
            Err(e) => {
                error!(error = %e, "Activation failed");
                self.teardown();
                return Err(e);
            }
        }

        loop {
            tokio::select! {
                // Handle commands
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            debug!("All sync handles dropped");
                            break;
                        }
                    }
                }

                // Handle relay messages
                msg = next_message(&mut self.subscription) => {
                    self.handle_relay_message(msg).await;
                }

                // Debounced publish
                _ = wait_until(self.publish_at) => {
                    self.publish_at = None;
                    let _ = self.publish_now().await;
                }
            }

            self.stats.write().uptime_secs = self.start_time.elapsed().as_secs();
        }

        self.teardown();
        info!("Read-state sync stopped");
        Ok(())
    }

    /// Seed from the newest remote event, then open the live subscription
    async fn activate(&mut self) -> Result<()> {
        if self.identity.is_none() {
            return Err(SyncError::IdentityUnavailable);
        }
        self.set_status(SessionStatus::Subscribing);

        let meta = self.session.store.sync_meta().await?;
        self.ensure_open()?;
        debug!(last_processed = meta.last_processed, "Activating sync session");

        match self.fetch_remote().await {
            FetchResult::Found(event) => self.handle_remote(event).await?,
            FetchResult::Empty => debug!("No remote read state yet"),
            FetchResult::Failed(e) => {
                // the live subscription still delivers anything newer
                let timed_out = matches!(e, SyncError::Timeout { .. });
                warn!(error = %e, timed_out, "Initial read-state fetch failed");
            }
        }
        self.ensure_open()?;

        if let Err(e) = self.open_subscription().await {
            if !e.is_transient() {
                return Err(e);
            }
            warn!(error = %e, "Subscription failed, retrying after next publish");
            self.resubscribe = true;
        }
        self.ensure_open()?;

        self.set_status(SessionStatus::Active);
        Ok(())
    }

    async fn open_subscription(&mut self) -> Result<()> {
        let meta = self.session.store.sync_meta().await?;
        let filter = self.sync_filter().since(meta.last_processed + 1);
        let subscription = self.session.transport.subscribe(filter).await?;
        self.ensure_open()?;

        debug!(since = meta.last_processed + 1, "Subscribed to read-state events");
        self.subscription = Some(subscription);
        self.resubscribe = false;
        Ok(())
    }

    fn sync_filter(&self) -> Filter {
        Filter::new()
            .kind(self.session.config.sync_kind)
            .author(self.session.pubkey.clone())
    }

    async fn fetch_remote(&self) -> FetchResult {
        transport::fetch_latest(
            self.session.transport.as_ref(),
            self.sync_filter().limit(1),
            self.session.config.fetch_timeout,
        )
        .await
    }

    /// Handle a command, returns false if should shutdown
    async fn handle_command(&mut self, cmd: SyncCommand) -> bool {
        match cmd {
            SyncCommand::MarkRead { marker, response } => {
                let result = self.mark_read(marker).await;
                let _ = response.send(result);
            }

            SyncCommand::Flush { response } => {
                let result = if self.publish_at.take().is_some() {
                    self.publish_now().await.map(|()| true)
                } else {
                    Ok(false)
                };
                let _ = response.send(result);
            }

            SyncCommand::GetStats { response } => {
                let stats = self.stats.read().clone();
                let _ = response.send(stats);
            }

            SyncCommand::Shutdown {
                reset_local_state,
                response,
            } => {
                info!(reset_local_state, "Shutdown requested");
                self.closed.store(true, Ordering::SeqCst);
                self.publish_at = None;
                self.subscription = None;

                let result = if reset_local_state {
                    self.decoded.clear();
                    self.session
                        .store
                        .clear_read_state()
                        .await
                        .map_err(SyncError::from)
                } else {
                    Ok(())
                };
                if let Err(ref e) = result {
                    error!(error = %e, "Failed to clear read state");
                }
                if let Some(response) = response {
                    let _ = response.send(result);
                }
                return false;
            }
        }

        true
    }

    async fn mark_read(&mut self, marker: ReadMarker) -> Result<bool> {
        self.ensure_open()?;
        let advanced = self.session.store.advance_marker(&marker).await?;
        self.ensure_open()?;

        if advanced && self.identity.is_some() {
            self.schedule_publish();
        }
        debug!(
            conversation = %marker.conversation,
            kind = marker.kind,
            created_at = marker.created_at,
            advanced,
            "Marked read"
        );
        Ok(advanced)
    }

    /// Replace any pending deadline with a fresh one
    fn schedule_publish(&mut self) {
        self.publish_at = Some(Instant::now() + self.session.config.debounce);
    }

    async fn handle_relay_message(&mut self, msg: Option<RelayMessage>) {
        match msg {
            Some(RelayMessage::Event(event)) => {
                if let Err(e) = self.handle_remote(event).await {
                    if e.is_identity_unavailable() {
                        self.degrade(e.to_string());
                    }
                }
            }
            Some(RelayMessage::EndOfStoredEvents) => {
                debug!("End of stored read-state events");
                let _ = self.event_tx.send(SyncEvent::EndOfStoredEvents);
            }
            None => {
                warn!("Read-state subscription closed by relay");
                self.subscription = None;
                self.resubscribe = true;
                let _ = self.event_tx.send(SyncEvent::SubscriptionClosed);
            }
        }
    }

    /// Run intake for one remote event and report the outcome
    async fn handle_remote(&mut self, event: SignedEvent) -> Result<()> {
        let event_id = event.id.clone();
        let created_at = event.created_at;

        match self.intake(event).await {
            Ok(IntakeOutcome::Merged {
                entries,
                dropped,
                changed,
            }) => {
                info!(%event_id, created_at, entries, dropped, changed, "Merged remote read state");
                {
                    let mut stats = self.stats.write();
                    stats.events_merged += 1;
                    stats.entries_dropped += dropped as u64;
                }
                let _ = self.event_tx.send(SyncEvent::RemoteMerged {
                    event_id,
                    created_at,
                    entries,
                    dropped,
                    changed,
                });
                Ok(())
            }
            Ok(IntakeOutcome::Echo) => {
                debug!(%event_id, created_at, "Skipped own echo");
                self.stats.write().echoes_skipped += 1;
                let _ = self
                    .event_tx
                    .send(SyncEvent::EchoSkipped { event_id, created_at });
                Ok(())
            }
            Ok(IntakeOutcome::Stale) => {
                debug!(%event_id, created_at, "Skipped already processed event");
                self.stats.write().events_stale += 1;
                Ok(())
            }
            Ok(IntakeOutcome::Rejected(reason)) => {
                warn!(%event_id, created_at, %reason, "Rejected remote read state");
                self.stats.write().events_rejected += 1;
                let _ = self
                    .event_tx
                    .send(SyncEvent::RemoteRejected { event_id, reason });
                Ok(())
            }
            Err(SyncError::Cancelled) => {
                debug!(%event_id, "Discarded intake result after shutdown");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                error!(%event_id, created_at, error = %e, "Remote read-state intake failed");
                Err(e)
            }
        }
    }

    /// Remote-event intake: validate, skip, or merge and replace
    async fn intake(&mut self, event: SignedEvent) -> Result<IntakeOutcome> {
        self.stats.write().events_received += 1;
        let now = self.session.clock.now();

        if let Some(reason) = self.reject_reason(&event, now) {
            return Ok(IntakeOutcome::Rejected(reason));
        }

        let meta = self.session.store.sync_meta().await?;
        self.ensure_open()?;

        if event.created_at == meta.last_published {
            if meta.last_processed < event.created_at {
                self.session
                    .store
                    .set_sync_meta(meta.processed(event.created_at))
                    .await?;
            }
            return Ok(IntakeOutcome::Echo);
        }
        if event.created_at <= meta.last_processed {
            return Ok(IntakeOutcome::Stale);
        }

        let remote = self.decode_remote(&event, now).await?;
        self.ensure_open()?;

        let local = self.session.store.all_markers().await?;
        self.ensure_open()?;

        let merged = merge(&local, &remote.markers);
        let changed = count_changes(&local, &merged);
        let meta = meta.processed(event.created_at);

        if changed == 0 {
            self.session.store.set_sync_meta(meta).await?;
        } else {
            self.session.store.replace_markers(&merged, Some(meta)).await?;
        }

        Ok(IntakeOutcome::Merged {
            entries: remote.markers.len(),
            dropped: remote.dropped,
            changed,
        })
    }

    fn reject_reason(&self, event: &SignedEvent, now: Timestamp) -> Option<String> {
        if event.pubkey != self.session.pubkey {
            return Some(format!("authored by {}", event.pubkey));
        }
        if event.kind != self.session.config.sync_kind {
            return Some(format!("unexpected kind {}", event.kind));
        }
        if let Err(e) = event.verify_id() {
            return Some(e.to_string());
        }
        let max = self.session.config.limits.max_timestamp(now);
        if event.created_at > max {
            return Some(format!("created_at {} is after {}", event.created_at, max));
        }
        None
    }

    /// Decrypt and decode a remote payload. Undecodable payloads count as
    /// having no entries.
    async fn decode_remote(&mut self, event: &SignedEvent, now: Timestamp) -> Result<DecodeReport> {
        if let Some(markers) = self.decoded.get(&event.id) {
            self.stats.write().decode_cache_hits += 1;
            return Ok(DecodeReport {
                markers: markers.clone(),
                dropped: 0,
            });
        }

        let identity = self
            .identity
            .clone()
            .ok_or(SyncError::IdentityUnavailable)?;

        match codec::decrypt_from_self(
            identity.as_ref(),
            &event.content,
            now,
            &self.session.config.limits,
        )
        .await
        {
            Ok(report) => {
                self.decoded.put(event.id.clone(), report.markers.clone());
                Ok(report)
            }
            Err(StateError::Identity(e)) if e.is_unavailable() => Err(SyncError::Identity(e)),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    created_at = event.created_at,
                    error = %e,
                    "Undecodable remote read state, treating as empty"
                );
                Ok(DecodeReport::default())
            }
        }
    }

    /// Run the publish path and handle its failure modes
    async fn publish_now(&mut self) -> Result<()> {
        match self.publish().await {
            Ok(()) => {
                if self.resubscribe {
                    if let Err(e) = self.open_subscription().await {
                        warn!(error = %e, "Re-subscribe failed");
                    }
                }
                Ok(())
            }
            Err(SyncError::Cancelled) => {
                debug!("Discarded publish after shutdown");
                Err(SyncError::Cancelled)
            }
            Err(e) if e.is_identity_unavailable() => {
                self.degrade(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Read-state publish failed");
                self.stats.write().publish_failures += 1;
                let _ = self.event_tx.send(SyncEvent::PublishFailed {
                    reason: e.to_string(),
                });
                if e.is_retryable() {
                    self.schedule_publish();
                }
                Err(e)
            }
        }
    }

    /// Fetch fresh remote state, merge, write locally, then publish
    async fn publish(&mut self) -> Result<()> {
        let identity = self
            .identity
            .clone()
            .ok_or(SyncError::IdentityUnavailable)?;
        let now = self.session.clock.now();

        // publishing without the remote set could drop keys only it has
        let remote = match self.fetch_remote().await {
            FetchResult::Found(event) => {
                self.ensure_open()?;
                match self.reject_reason(&event, now) {
                    None => self.decode_remote(&event, now).await?.markers,
                    Some(reason) => {
                        warn!(event_id = %event.id, %reason, "Ignoring fetched read state");
                        Vec::new()
                    }
                }
            }
            FetchResult::Empty => Vec::new(),
            FetchResult::Failed(e) => return Err(e),
        };
        self.ensure_open()?;

        let local = self.session.store.all_markers().await?;
        self.ensure_open()?;

        let mut merged = merge(&local, &remote);
        if let Some(cutoff) = self.session.config.retention_cutoff(now) {
            let (kept, pruned) = prune(merged, cutoff);
            if !pruned.is_empty() {
                debug!(pruned = pruned.len(), cutoff, "Pruned stale read markers");
            }
            merged = kept;
        }

        self.session.store.replace_markers(&merged, None).await?;
        self.ensure_open()?;

        let meta = self.session.store.sync_meta().await?;
        let created_at = meta.next_publish_at(now);

        let content = codec::encrypt_for_self(identity.as_ref(), &merged).await?;
        self.ensure_open()?;

        let unsigned = UnsignedEvent::new(
            self.session.pubkey.clone(),
            created_at,
            self.session.config.sync_kind,
            content,
        );
        let event = identity.sign(unsigned).await?;
        self.ensure_open()?;

        let event_id = event.id.clone();
        self.session.transport.publish(event).await?;

        // the relay accepted it; record before honouring a late shutdown
        self.session
            .store
            .set_sync_meta(meta.published(created_at))
            .await?;

        info!(%event_id, created_at, entries = merged.len(), "Published read state");
        {
            let mut stats = self.stats.write();
            stats.publishes += 1;
            stats.last_published_at = Some(chrono::Utc::now());
        }
        let _ = self.event_tx.send(SyncEvent::Published {
            event_id,
            created_at,
            entries: merged.len(),
        });

        self.ensure_open()
    }

    /// Drop to local-only operation after losing the signer
    fn degrade(&mut self, reason: String) {
        warn!(%reason, "Read-state sync unavailable, continuing local-only");
        self.identity = None;
        self.subscription = None;
        self.publish_at = None;
        self.set_status(SessionStatus::LocalOnly);
        let _ = self.event_tx.send(SyncEvent::Degraded { reason });
    }

    fn teardown(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscription = None;
        self.publish_at = None;
        self.set_status(SessionStatus::Idle);
        let _ = self.event_tx.send(SyncEvent::Stopped);
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!(?previous, ?status, "Sync status changed");
            let _ = self.event_tx.send(SyncEvent::StatusChanged { status });
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<RelayMessage> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
