// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite durable tier.
//!
//! Crash-safe persistence with reservation leases, retry accounting and
//! size-bounded trimming. All access is serialized through one async mutex
//! around a single-connection pool, so the retained write transaction,
//! reads and reservations never interleave.
//!
//! # Failure handling
//!
//! A database error in the middle of an operation is reported through
//! [`StorageObserver::on_storage_failed`], the database is thrown away, and
//! the recovery ladder (see [`OpenStage`]) runs from `Clean` onwards. Once
//! nothing can be opened the tier sits in `None` and every call returns an
//! empty result without further notifications.

mod database;
mod open;
pub(crate) mod schema;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use self::database::Database;
use self::open::open_database;
use super::traits::{null_observer, OfflineStorage, RecordSink, StorageError, StorageObserver};
use crate::config::StorageConfig;
use crate::metrics;
use crate::record::{EventLatency, RecordFilter, StorageRecord};
use crate::resilience::recovery::{DatabaseRegistry, OpenStage};

const TIER: &str = "sqlite";

struct SqlState {
    db: Option<Database>,
    stage: OpenStage,
}

pub struct SqlStorage {
    config: StorageConfig,
    registry: DatabaseRegistry,
    state: Arc<AsyncMutex<SqlState>>,
    observer: RwLock<Arc<dyn StorageObserver>>,
    commit_task: Mutex<Option<JoinHandle<()>>>,
    last_read_count: AtomicUsize,
}

fn error_kind(err: &StorageError) -> &'static str {
    match err {
        StorageError::Invalid(_) => "invalid",
        StorageError::NotOpen => "not_open",
        StorageError::Database(_) => "database",
        StorageError::Io(_) => "io",
        StorageError::InUse(_) => "in_use",
        StorageError::SchemaFromFuture { .. } => "schema",
        StorageError::TrimIncomplete { .. } => "trim",
    }
}

impl SqlStorage {
    /// Storage with a registry of its own.
    ///
    /// Nothing else knows this instance holds its path. When another instance
    /// may open the same file, build both with [`SqlStorage::with_registry`]
    /// so `Clean` never deletes a file still in use.
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self::with_registry(config, DatabaseRegistry::new())
    }

    /// Storage that records its holds in `registry`.
    #[must_use]
    pub fn with_registry(config: StorageConfig, registry: DatabaseRegistry) -> Self {
        Self {
            config,
            registry,
            state: Arc::new(AsyncMutex::new(SqlState {
                db: None,
                stage: OpenStage::None,
            })),
            observer: RwLock::new(null_observer()),
            commit_task: Mutex::new(None),
            last_read_count: AtomicUsize::new(0),
        }
    }

    fn observer(&self) -> Arc<dyn StorageObserver> {
        self.observer.read().clone()
    }

    /// Registry this storage records its holds in.
    #[must_use]
    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    /// Where the tier currently lives.
    pub async fn open_stage(&self) -> OpenStage {
        self.state.lock().await.stage
    }

    /// Report a mid-operation failure and rebuild the database.
    async fn fail(&self, state: &mut SqlState, operation: &'static str, err: StorageError) {
        error!(operation, stage = %state.stage, error = %err, "Durable storage operation failed, recreating database");
        metrics::record_error(TIER, operation, error_kind(&err));
        let observer = self.observer();
        observer.on_storage_failed(&err.to_string());

        if let Some(db) = state.db.take() {
            db.abandon().await;
        }
        let (stage, db) = open_database(OpenStage::Clean, &self.config, &self.registry, &observer).await;
        state.stage = stage;
        state.db = db;
    }

    /// Trim once; `true` when the database ends up within its limit.
    async fn trim(&self, state: &mut SqlState) -> bool {
        let limit = self.config.max_storage_bytes;
        let Some(db) = state.db.as_mut() else {
            return false;
        };
        match db.trim(self.config.effective_trim_percent()).await {
            Ok(report) => {
                let dropped: usize = report.dropped.values().sum();
                metrics::record_dropped(TIER, "trim", dropped);
                metrics::set_database_bytes(report.size_after);
                if !report.dropped.is_empty() {
                    warn!(dropped, size = report.size_after, limit, "Durable storage trimmed");
                    self.observer().on_storage_trimmed(&report.dropped);
                }
                if report.size_after > limit {
                    let err = StorageError::TrimIncomplete {
                        size: report.size_after,
                        limit,
                    };
                    warn!(error = %err, "Trim did not bring storage under its limit");
                    metrics::record_error(TIER, "trim", error_kind(&err));
                    self.observer().on_storage_failed(&err.to_string());
                    return false;
                }
                true
            }
            Err(e) => {
                self.fail(state, "trim", e).await;
                false
            }
        }
    }

    fn start_commit_timer(&self) {
        let Some(period) = self.config.auto_commit_interval() else {
            return;
        };
        let state: Weak<AsyncMutex<SqlState>> = Arc::downgrade(&self.state);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let mut guard = state.lock().await;
                if let Some(db) = guard.db.as_mut() {
                    if let Err(e) = db.commit().await {
                        warn!(error = %e, "Periodic commit failed");
                        metrics::record_error(TIER, "commit", error_kind(&e));
                    }
                }
            }
        });
        if let Some(previous) = self.commit_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_commit_timer(&self) {
        if let Some(handle) = self.commit_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SqlStorage {
    fn drop(&mut self) {
        self.stop_commit_timer();
    }
}

#[async_trait]
impl OfflineStorage for SqlStorage {
    #[instrument(skip_all, fields(path = %self.config.cache_file_path))]
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) {
        *self.observer.write() = observer.clone();
        let mut state = self.state.lock().await;
        if let Some(db) = state.db.take() {
            debug!("Re-initializing, closing previous database");
            if let Err(e) = db.close().await {
                warn!(error = %e, "Closing previous database failed");
            }
        }

        let (stage, db) = open_database(OpenStage::Default, &self.config, &self.registry, &observer).await;
        state.stage = stage;
        state.db = db;
        drop(state);

        self.start_commit_timer();
    }

    #[instrument(skip_all, fields(path = %self.config.cache_file_path))]
    async fn shutdown(&self) {
        self.stop_commit_timer();
        let mut state = self.state.lock().await;
        if let Some(db) = state.db.take() {
            if let Err(e) = db.close().await {
                warn!(error = %e, "Final commit failed during shutdown");
                metrics::record_error(TIER, "shutdown", error_kind(&e));
            }
        }
        state.stage = OpenStage::None;
    }

    async fn flush(&self) {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return;
        };
        if let Err(e) = db.commit().await {
            self.fail(&mut state, "flush", e).await;
        }
    }

    async fn store_record(&self, record: StorageRecord) -> bool {
        if let Err(e) = record.validate() {
            warn!(id = %record.id, error = %e, "Rejecting invalid record");
            metrics::record_rejected(TIER, 1);
            self.observer().on_storage_failed("Invalid parameters");
            return false;
        }

        let _timer = crate::time_operation!("sqlite", "store");
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return false;
        };
        match db.insert(&record).await {
            Ok(size) => {
                metrics::record_stored(TIER, 1);
                if size > self.config.max_storage_bytes {
                    debug!(size, limit = self.config.max_storage_bytes, "Durable storage over limit");
                    self.trim(&mut state).await;
                }
                true
            }
            Err(e) => {
                self.fail(&mut state, "store", e).await;
                false
            }
        }
    }

    async fn get_and_reserve_records(
        &self,
        sink: &mut dyn RecordSink,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        let _timer = crate::time_operation!("sqlite", "reserve");
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            self.last_read_count.store(0, Ordering::Release);
            return true;
        };
        match db.reserve(sink, lease, min_latency, max_count).await {
            Ok(count) => {
                self.last_read_count.store(count, Ordering::Release);
                if count > 0 {
                    trace!(count, lease = ?lease, "Reserved durable records");
                    metrics::record_reserved(TIER, count);
                }
                true
            }
            Err(e) => {
                self.last_read_count.store(0, Ordering::Release);
                self.fail(&mut state, "reserve", e).await;
                false
            }
        }
    }

    fn is_last_read_from_memory(&self) -> bool {
        false
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::Acquire)
    }

    async fn release_records(&self, ids: &[String], increment_retry_count: bool) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return;
        };
        match db.release(ids, increment_retry_count, self.config.max_retry_count).await {
            Ok(dropped) if !dropped.is_empty() => {
                let count: usize = dropped.values().sum();
                warn!(count, max_retry_count = self.config.max_retry_count, "Dropped records over retry limit");
                metrics::record_dropped(TIER, "retry_limit", count);
                self.observer().on_storage_records_dropped(&dropped);
            }
            Ok(_) => {}
            Err(e) => self.fail(&mut state, "release", e).await,
        }
    }

    async fn delete_records(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return;
        };
        if let Err(e) = db.delete(ids).await {
            self.fail(&mut state, "delete", e).await;
        }
    }

    async fn delete_records_where(&self, filter: &RecordFilter) {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return;
        };
        match db.delete_where(filter).await {
            Ok(deleted) => trace!(deleted, "Deleted records by filter"),
            Err(e) => self.fail(&mut state, "delete", e).await,
        }
    }

    async fn delete_all_records(&self) {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return;
        };
        if let Err(e) = db.delete_all().await {
            self.fail(&mut state, "delete", e).await;
        }
    }

    async fn get_record_count(&self, latency: EventLatency) -> usize {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return 0;
        };
        match db.count(latency).await {
            Ok(count) => count,
            Err(e) => {
                self.fail(&mut state, "count", e).await;
                0
            }
        }
    }

    async fn get_size(&self) -> u64 {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return 0;
        };
        match db.size().await {
            Ok(size) => {
                metrics::set_database_bytes(size);
                size
            }
            Err(e) => {
                self.fail(&mut state, "size", e).await;
                0
            }
        }
    }

    async fn get_records(&self, shutdown: bool, min_latency: EventLatency, max_count: usize) -> Vec<StorageRecord> {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return Vec::new();
        };
        match db.records(shutdown, min_latency, max_count).await {
            Ok(records) => records,
            Err(e) => {
                self.fail(&mut state, "records", e).await;
                Vec::new()
            }
        }
    }

    async fn resize_db(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return false;
        };
        match db.size().await {
            Ok(size) if size <= self.config.max_storage_bytes => true,
            Ok(_) => self.trim(&mut state).await,
            Err(e) => {
                self.fail(&mut state, "size", e).await;
                false
            }
        }
    }

    async fn store_setting(&self, name: &str, value: &str) -> bool {
        if name.is_empty() {
            self.observer().on_storage_failed("Invalid parameters");
            return false;
        }
        if value.is_empty() {
            return self.delete_setting(name).await;
        }
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return false;
        };
        match db.store_setting(name, value).await {
            Ok(()) => true,
            Err(e) => {
                self.fail(&mut state, "settings", e).await;
                false
            }
        }
    }

    async fn get_setting(&self, name: &str) -> String {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return String::new();
        };
        match db.get_setting(name).await {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                self.fail(&mut state, "settings", e).await;
                String::new()
            }
        }
    }

    async fn delete_setting(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(db) = state.db.as_mut() else {
            return false;
        };
        match db.delete_setting(name).await {
            Ok(()) => true,
            Err(e) => {
                self.fail(&mut state, "settings", e).await;
                false
            }
        }
    }
}
