// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage record data structure.
//!
//! The [`StorageRecord`] is the unit that flows through every tier. The
//! payload is an opaque serialized event; the cache only looks at the
//! metadata around it (tenant, latency, persistence, time, lease state).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery urgency of a record. Also used as the eviction precedence.
///
/// Ordering follows the discriminants, so `Off < Normal < CostDeferred <
/// RealTime < Max`. `Unspecified` is a query wildcard and never a stored
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventLatency {
    Unspecified = -1,
    Off = 0,
    Normal = 1,
    CostDeferred = 2,
    RealTime = 3,
    Max = 4,
}

impl EventLatency {
    /// All concrete (storable) latencies, lowest first.
    pub const CONCRETE: [EventLatency; 5] = [
        EventLatency::Off,
        EventLatency::Normal,
        EventLatency::CostDeferred,
        EventLatency::RealTime,
        EventLatency::Max,
    ];

    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decode a stored integer. Unknown values degrade to `Normal`.
    #[must_use]
    pub fn from_stored(value: i64) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Normal,
            2 => Self::CostDeferred,
            3 => Self::RealTime,
            4 => Self::Max,
            _ => Self::Normal,
        }
    }

    /// Index into a per-latency bucket array. `None` for the wildcard.
    #[must_use]
    pub fn bucket(self) -> Option<usize> {
        match self {
            Self::Unspecified => None,
            other => Some(other as usize),
        }
    }

    /// Lower bound for queries: the wildcard means "from `Off` upwards".
    #[must_use]
    pub fn floor(self) -> Self {
        match self {
            Self::Unspecified => Self::Off,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Off => "off",
            Self::Normal => "normal",
            Self::CostDeferred => "cost_deferred",
            Self::RealTime => "real_time",
            Self::Max => "max",
        }
    }
}

impl std::fmt::Display for EventLatency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a record may be dropped early under size pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventPersistence {
    #[default]
    Normal = 1,
    Critical = 2,
}

impl EventPersistence {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_stored(value: i64) -> Self {
        if value == 2 {
            Self::Critical
        } else {
            Self::Normal
        }
    }
}

/// Per-tenant record counts reported to the observer.
pub type TenantCounts = BTreeMap<String, usize>;

/// Reasons a record is refused before it reaches any tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record id is empty")]
    EmptyId,
    #[error("tenant token is empty")]
    EmptyTenantToken,
    #[error("latency must be a concrete value")]
    UnspecifiedLatency,
    #[error("timestamp must be positive, got {0}")]
    NonPositiveTimestamp(i64),
}

/// One cached telemetry event.
///
/// # Example
///
/// ```
/// use telemetry_cache::{StorageRecord, EventLatency, EventPersistence};
///
/// let record = StorageRecord::new(
///     "evt-1",
///     "tenant-a",
///     EventLatency::Normal,
///     EventPersistence::Normal,
///     b"payload".to_vec(),
/// );
///
/// assert!(record.validate().is_ok());
/// assert_eq!(record.retry_count, 0);
/// assert!(!record.is_reserved(record.timestamp));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: String,
    pub tenant_token: String,
    pub latency: EventLatency,
    pub persistence: EventPersistence,
    /// Logical insertion time (epoch millis); orders records within a latency.
    pub timestamp: i64,
    pub blob: Vec<u8>,
    pub retry_count: u32,
    /// Lease deadline (epoch millis). 0 when not reserved.
    pub reserved_until: i64,
}

impl StorageRecord {
    /// Create a record stamped with the current wall-clock time.
    pub fn new(
        id: impl Into<String>,
        tenant_token: impl Into<String>,
        latency: EventLatency,
        persistence: EventPersistence,
        blob: Vec<u8>,
    ) -> Self {
        Self::with_timestamp(id, tenant_token, latency, persistence, now_ms(), blob)
    }

    pub fn with_timestamp(
        id: impl Into<String>,
        tenant_token: impl Into<String>,
        latency: EventLatency,
        persistence: EventPersistence,
        timestamp: i64,
        blob: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_token: tenant_token.into(),
            latency,
            persistence,
            timestamp,
            blob,
            retry_count: 0,
            reserved_until: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.tenant_token.is_empty() {
            return Err(ValidationError::EmptyTenantToken);
        }
        if self.latency == EventLatency::Unspecified {
            return Err(ValidationError::UnspecifiedLatency);
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::NonPositiveTimestamp(self.timestamp));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_reserved(&self, now: i64) -> bool {
        self.reserved_until > now
    }

    /// Approximate in-memory footprint used for tier accounting.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        (RECORD_OVERHEAD + self.id.len() + self.tenant_token.len() + self.blob.len()) as u64
    }
}

/// Fixed per-record bookkeeping cost added to the payload size.
pub const RECORD_OVERHEAD: usize = std::mem::size_of::<StorageRecord>();

/// Typed replacement for a free-form `WHERE key=value AND ...` map.
///
/// Every populated field must match. An empty filter matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tenant_token: Option<String>,
    #[serde(default)]
    pub latency: Option<EventLatency>,
    #[serde(default)]
    pub persistence: Option<EventPersistence>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl RecordFilter {
    #[must_use]
    pub fn tenant(token: impl Into<String>) -> Self {
        Self {
            tenant_token: Some(token.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.tenant_token.is_none()
            && self.latency.is_none()
            && self.persistence.is_none()
            && self.retry_count.is_none()
    }

    #[must_use]
    pub fn matches(&self, record: &StorageRecord) -> bool {
        if self.is_empty() {
            return false;
        }
        self.id.as_ref().map_or(true, |id| *id == record.id)
            && self
                .tenant_token
                .as_ref()
                .map_or(true, |t| *t == record.tenant_token)
            && self.latency.map_or(true, |l| l == record.latency)
            && self.persistence.map_or(true, |p| p == record.persistence)
            && self.retry_count.map_or(true, |r| r == record.retry_count)
    }
}

/// Wall-clock epoch millis. Leases are compared against this.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Group records by tenant token.
pub(crate) fn count_by_tenant<'a>(records: impl IntoIterator<Item = &'a StorageRecord>) -> TenantCounts {
    let mut counts = TenantCounts::new();
    for record in records {
        *counts.entry(record.tenant_token.clone()).or_insert(0) += 1;
    }
    counts
}
