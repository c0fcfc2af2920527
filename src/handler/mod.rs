// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier multiplexer.
//!
//! The [`OfflineStorageHandler`] owns an optional memory tier and the SQLite
//! durable tier and presents them as one
//! [`OfflineStorage`](crate::storage::traits::OfflineStorage).
//!
//! ```text
//!            store_record                     get_and_reserve_records
//!                 │                                     │
//!                 ▼                                     ▼
//! ┌───────────────────────────────┐      memory first; durable only
//! │  Memory tier (optional)       │      when memory returned nothing
//! │  bounded by memory_queue_bytes│
//! └───────────────────────────────┘
//!                 │  overflow migration (oldest, lowest latency first)
//!                 │  flush / shutdown drain
//!                 ▼
//! ┌───────────────────────────────┐
//! │  SQLite durable tier          │
//! └───────────────────────────────┘
//! ```
//!
//! Release and delete fan out to both tiers; each ignores ids it does not
//! hold. Settings live in the durable tier only.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telemetry_cache::{
//!     EventLatency, EventPersistence, NullObserver, OfflineStorage, OfflineStorageHandler,
//!     RecordBatch, StorageConfig, StorageRecord,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let handler = OfflineStorageHandler::new(StorageConfig::default());
//! handler.initialize(Arc::new(NullObserver)).await;
//!
//! let record = StorageRecord::new("evt-1", "tenant", EventLatency::Normal, EventPersistence::Normal, vec![1, 2, 3]);
//! handler.store_record(record).await;
//!
//! let mut batch = RecordBatch::new().with_max_records(100);
//! handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await;
//! handler.delete_records(&batch.ids()).await;
//!
//! handler.shutdown().await;
//! # }
//! ```

mod api;
mod flush;
mod lifecycle;

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::resilience::recovery::DatabaseRegistry;
use crate::storage::traits::{null_observer, StorageObserver};
use crate::storage::{MemoryStorage, SqlStorage};

/// Memory tier in front of the durable tier.
///
/// # Thread Safety
///
/// The memory tier may be written from any number of threads. Durable tier
/// access is serialized internally; the handler assumes one uploader issues
/// reservations and releases.
pub struct OfflineStorageHandler {
    pub(super) config: StorageConfig,

    /// Fast tier; `None` when `memory_queue_bytes == 0`
    pub(super) memory: Option<Arc<MemoryStorage>>,

    pub(super) durable: Arc<SqlStorage>,

    pub(super) observer: RwLock<Arc<dyn StorageObserver>>,

    /// Serializes overflow migrations so concurrent writers do not each
    /// move a batch for the same overflow
    pub(super) migration: Mutex<()>,

    pub(super) last_read_from_memory: AtomicBool,
    pub(super) last_read_count: AtomicUsize,

    /// Set by shutdown; writes are refused afterwards
    pub(super) closed: AtomicBool,
}

impl OfflineStorageHandler {
    /// Handler whose durable tier gets a registry of its own. See
    /// [`SqlStorage::new`] for when to share one instead.
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self::with_registry(config, DatabaseRegistry::new())
    }

    #[must_use]
    pub fn with_registry(config: StorageConfig, registry: DatabaseRegistry) -> Self {
        let memory = config
            .memory_tier_enabled()
            .then(|| Arc::new(MemoryStorage::new(config.max_retry_count)));
        let durable = Arc::new(SqlStorage::with_registry(config.clone(), registry));

        Self {
            config,
            memory,
            durable,
            observer: RwLock::new(null_observer()),
            migration: Mutex::new(()),
            last_read_from_memory: AtomicBool::new(false),
            last_read_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The memory tier, if configured.
    #[must_use]
    pub fn memory(&self) -> Option<&Arc<MemoryStorage>> {
        self.memory.as_ref()
    }

    #[must_use]
    pub fn durable(&self) -> &Arc<SqlStorage> {
        &self.durable
    }

    pub(super) fn observer(&self) -> Arc<dyn StorageObserver> {
        self.observer.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tier_follows_config() {
        let handler = OfflineStorageHandler::with_registry(StorageConfig::default(), DatabaseRegistry::new());
        assert!(handler.memory().is_some());

        let config = StorageConfig {
            memory_queue_bytes: 0,
            ..Default::default()
        };
        let handler = OfflineStorageHandler::with_registry(config, DatabaseRegistry::new());
        assert!(handler.memory().is_none());
    }
}
