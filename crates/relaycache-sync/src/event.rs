//! Sync events
//!
//! Events emitted by the sync service for consumption by other parts
//! of the application.

use chrono::{DateTime, Utc};
use relaycache_core::Timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Not started, or torn down
    #[default]
    Idle,
    /// Seeding from the relay and opening the live subscription
    Subscribing,
    /// Live subscription open
    Active,
    /// No signer; markers are kept locally and never published
    LocalOnly,
}

impl SessionStatus {
    /// Whether remote sync is running
    pub fn is_syncing(&self) -> bool {
        matches!(self, SessionStatus::Subscribing | SessionStatus::Active)
    }
}

/// Events emitted by the sync service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Session state changed
    StatusChanged { status: SessionStatus },

    /// A remote sync event was merged into the local markers
    RemoteMerged {
        event_id: String,
        created_at: Timestamp,
        /// Entries decoded from the remote payload
        entries: usize,
        /// Entries rejected by validation
        dropped: usize,
        /// Keys whose local marker moved
        changed: usize,
    },

    /// This device's own publish came back from the relay
    EchoSkipped { event_id: String, created_at: Timestamp },

    /// A remote event failed the intake checks
    RemoteRejected { event_id: String, reason: String },

    /// The merged marker set was published
    Published {
        event_id: String,
        created_at: Timestamp,
        entries: usize,
    },

    /// A publish attempt failed and local state was kept
    PublishFailed { reason: String },

    /// The relay finished sending stored events
    EndOfStoredEvents,

    /// The relay closed the live subscription; it is re-opened after the
    /// next successful publish
    SubscriptionClosed,

    /// Sync fell back to local-only operation
    Degraded { reason: String },

    /// The service loop exited
    Stopped,
}

impl SyncEvent {
    /// Check if this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SyncEvent::RemoteRejected { .. } | SyncEvent::PublishFailed { .. } | SyncEvent::Degraded { .. }
        )
    }

    /// The event id this notification refers to, if any
    pub fn event_id(&self) -> Option<&str> {
        match self {
            SyncEvent::RemoteMerged { event_id, .. }
            | SyncEvent::EchoSkipped { event_id, .. }
            | SyncEvent::RemoteRejected { event_id, .. }
            | SyncEvent::Published { event_id, .. } => Some(event_id),
            _ => None,
        }
    }
}

/// Statistics about a sync session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// Remote sync events handed to intake
    pub events_received: u64,
    /// Remote events merged into local state
    pub events_merged: u64,
    /// Remote events at or below the processed watermark
    pub events_stale: u64,
    /// Own echoes skipped
    pub echoes_skipped: u64,
    /// Remote events rejected by intake checks
    pub events_rejected: u64,
    /// Wire entries dropped by validation
    pub entries_dropped: u64,
    /// Decoded payloads served from cache
    pub decode_cache_hits: u64,
    /// Successful publishes
    pub publishes: u64,
    /// Failed publish attempts
    pub publish_failures: u64,
    /// Wall-clock time of the last successful publish
    pub last_published_at: Option<DateTime<Utc>>,
    /// Uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_helpers() {
        let event = SyncEvent::Published {
            event_id: "abc".into(),
            created_at: 1,
            entries: 2,
        };
        assert_eq!(event.event_id(), Some("abc"));
        assert!(!event.is_failure());
        assert!(SyncEvent::PublishFailed { reason: "x".into() }.is_failure());
        assert_eq!(SyncEvent::Stopped.event_id(), None);
    }

    #[test]
    fn test_status() {
        assert_eq!(SessionStatus::default(), SessionStatus::Idle);
        assert!(SessionStatus::Active.is_syncing());
        assert!(!SessionStatus::LocalOnly.is_syncing());
    }
}
