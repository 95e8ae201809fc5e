//! Configuration types for the local cache and read-state sync
//!
//! All policy constants (clock skew, timestamp floor, debounce delay,
//! retention window) live here so embedders can tune them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event::{is_replaceable, Kind, Timestamp};
use crate::{CoreError, Result};

/// Default kind of the replaceable last-seen sync event
pub const DEFAULT_SYNC_KIND: Kind = 10_888;

/// Tolerated clock skew for remote timestamps, in seconds
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 300;

/// 2020-01-01T00:00:00Z
pub const DEFAULT_MIN_TIMESTAMP: Timestamp = 1_577_836_800;

/// Upper bound (exclusive) on wire string field lengths
pub const DEFAULT_MAX_FIELD_LEN: usize = 1000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayCacheConfig {
    /// Local store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Read-state sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

impl RelayCacheConfig {
    /// Parse from JSON, filling missing sections with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check for nonsensical values
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.sync.validate()
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sqlx database URL, e.g. `sqlite:relaycache.db?mode=rwc`
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
    /// Capacity of the change-notification channel
    pub change_buffer: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:relaycache.db?mode=rwc".to_string(),
            max_connections: 4,
            change_buffer: 256,
        }
    }
}

impl StorageConfig {
    /// Configuration for a private in-memory database
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            // every in-memory connection is a separate database
            max_connections: 1,
            change_buffer: 256,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(CoreError::InvalidConfig("database_url is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(CoreError::InvalidConfig("max_connections must be > 0".into()));
        }
        if self.change_buffer == 0 {
            return Err(CoreError::InvalidConfig("change_buffer must be > 0".into()));
        }
        Ok(())
    }
}

/// Read-state sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Replaceable event kind carrying the encrypted read markers
    pub sync_kind: Kind,
    /// Delay between a mark-read and the coalesced publish
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// Timeout for fetching the latest remote sync event
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Markers older than this are pruned before publishing (None = keep all)
    #[serde(default, with = "humantime_serde::option")]
    pub marker_retention: Option<Duration>,
    /// Bounds applied to decoded wire entries
    #[serde(default)]
    pub limits: ValidationLimits,
    /// Capacity of the decoded-payload cache
    pub decode_cache_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_kind: DEFAULT_SYNC_KIND,
            debounce: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            marker_retention: None,
            limits: ValidationLimits::default(),
            decode_cache_size: 16,
        }
    }
}

impl SyncConfig {
    /// Retention cutoff relative to `now`, if pruning is enabled
    pub fn retention_cutoff(&self, now: Timestamp) -> Option<Timestamp> {
        self.marker_retention
            .map(|window| {
                now.saturating_sub(i64::try_from(window.as_secs()).unwrap_or(i64::MAX))
            })
    }

    /// Check for nonsensical values
    pub fn validate(&self) -> Result<()> {
        if !is_replaceable(self.sync_kind) {
            return Err(CoreError::InvalidConfig(format!(
                "sync_kind {} is not in the replaceable range",
                self.sync_kind
            )));
        }
        if self.debounce.is_zero() {
            return Err(CoreError::InvalidConfig("debounce must be > 0".into()));
        }
        if self.fetch_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("fetch_timeout must be > 0".into()));
        }
        if self.decode_cache_size == 0 {
            return Err(CoreError::InvalidConfig("decode_cache_size must be > 0".into()));
        }
        self.limits.validate()
    }
}

/// Defensive bounds for decoded wire entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Seconds a timestamp may lie in the future
    pub max_clock_skew_secs: i64,
    /// Earliest acceptable timestamp
    pub min_timestamp: Timestamp,
    /// String fields must be strictly shorter than this
    pub max_field_len: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            min_timestamp: DEFAULT_MIN_TIMESTAMP,
            max_field_len: DEFAULT_MAX_FIELD_LEN,
        }
    }
}

impl ValidationLimits {
    /// Latest acceptable timestamp given the local clock
    pub fn max_timestamp(&self, now: Timestamp) -> Timestamp {
        now.saturating_add(self.max_clock_skew_secs)
    }

    /// Whether `timestamp` lies in `[min_timestamp, now + skew]`
    pub fn timestamp_in_range(&self, timestamp: Timestamp, now: Timestamp) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp(now)
    }

    fn validate(&self) -> Result<()> {
        if self.max_clock_skew_secs < 0 {
            return Err(CoreError::InvalidConfig("max_clock_skew_secs must be >= 0".into()));
        }
        if self.max_field_len == 0 {
            return Err(CoreError::InvalidConfig("max_field_len must be > 0".into()));
        }
        Ok(())
    }
}

// Helper module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| humantime::format_duration(d).to_string())
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
