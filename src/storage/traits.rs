use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{EventLatency, RecordFilter, StorageRecord, TenantCounts, ValidationError};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid parameters: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Database is not open")]
    NotOpen,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database file {0} is held by another instance")]
    InUse(String),
    #[error("Database schema version {found} is newer than supported {expected}")]
    SchemaFromFuture { found: i64, expected: i64 },
    #[error("Trim left database at {size} bytes, limit is {limit}")]
    TrimIncomplete { size: u64, limit: u64 },
}

/// Notification channel from a storage back to its owner.
///
/// Callbacks may fire from inside any storage operation, so implementations
/// must be cheap and must not call back into the storage.
pub trait StorageObserver: Send + Sync {
    /// `description` is `"<engine>/<state>"`, e.g. `"SQLite/Default"`.
    fn on_storage_opened(&self, description: &str);
    fn on_storage_failed(&self, reason: &str);
    fn on_storage_open_failed(&self, reason: &str);
    fn on_storage_trimmed(&self, counts: &TenantCounts);
    fn on_storage_records_dropped(&self, counts: &TenantCounts);
    fn on_storage_records_rejected(&self, counts: &TenantCounts);
    fn on_storage_records_saved(&self, count: usize);
}

/// Observer that ignores everything. Installed until `initialize` runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StorageObserver for NullObserver {
    fn on_storage_opened(&self, _description: &str) {}
    fn on_storage_failed(&self, _reason: &str) {}
    fn on_storage_open_failed(&self, _reason: &str) {}
    fn on_storage_trimmed(&self, _counts: &TenantCounts) {}
    fn on_storage_records_dropped(&self, _counts: &TenantCounts) {}
    fn on_storage_records_rejected(&self, _counts: &TenantCounts) {}
    fn on_storage_records_saved(&self, _count: usize) {}
}

pub(crate) fn null_observer() -> Arc<dyn StorageObserver> {
    Arc::new(NullObserver)
}

/// Receiving end of [`OfflineStorage::get_and_reserve_records`].
///
/// Records are pulled from the tier one at a time and offered here. Returning
/// `false` hands the record back (it stays available) and ends the pull.
pub trait RecordSink: Send {
    fn accept(&mut self, record: StorageRecord) -> bool;
}

impl<F> RecordSink for F
where
    F: FnMut(StorageRecord) -> bool + Send,
{
    fn accept(&mut self, record: StorageRecord) -> bool {
        self(record)
    }
}

/// Collects records until a count or payload-byte budget is reached.
#[derive(Debug, Default)]
pub struct RecordBatch {
    pub records: Vec<StorageRecord>,
    max_records: Option<usize>,
    max_bytes: Option<usize>,
    bytes: usize,
}

impl RecordBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }

    /// The first record is always taken, even if it alone exceeds the budget.
    #[must_use]
    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = Some(max);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<StorageRecord> {
        self.records
    }
}

impl RecordSink for RecordBatch {
    fn accept(&mut self, record: StorageRecord) -> bool {
        if self.max_records.is_some_and(|max| self.records.len() >= max) {
            return false;
        }
        if let Some(max) = self.max_bytes {
            if !self.records.is_empty() && self.bytes + record.blob.len() > max {
                return false;
            }
        }
        self.bytes += record.blob.len();
        self.records.push(record);
        true
    }
}

/// The contract shared by every tier and by the tier multiplexer.
///
/// Every method is total: failures are reported through the observer and
/// surface as empty / `false` / zero results, never as panics or errors.
#[async_trait]
pub trait OfflineStorage: Send + Sync {
    /// Open backing resources. The instance stays callable even if this fails.
    async fn initialize(&self, observer: Arc<dyn StorageObserver>);

    /// Flush and release resources. Idempotent.
    async fn shutdown(&self);

    /// Make pending writes durable.
    async fn flush(&self);

    async fn store_record(&self, record: StorageRecord) -> bool;

    /// Returns how many records were stored.
    async fn store_records(&self, records: Vec<StorageRecord>) -> usize {
        let mut stored = 0;
        for record in records {
            if self.store_record(record).await {
                stored += 1;
            }
        }
        stored
    }

    /// Reclaim expired leases, then stream the oldest available records of
    /// the highest latency class `>= min_latency` into `sink`, reserving
    /// every accepted record for `lease`. `max_count == 0` means unlimited.
    ///
    /// Returns `false` only when the storage itself failed.
    async fn get_and_reserve_records(
        &self,
        sink: &mut dyn RecordSink,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool;

    fn is_last_read_from_memory(&self) -> bool;

    fn last_read_record_count(&self) -> usize;

    /// Clear reservations; with `increment_retry_count` records over the
    /// retry limit are dropped and reported. Unknown ids are ignored.
    async fn release_records(&self, ids: &[String], increment_retry_count: bool);

    /// Clear every reservation without touching retry counts.
    async fn release_all_records(&self) {}

    /// Unconditional removal. Unknown ids are ignored.
    async fn delete_records(&self, ids: &[String]);

    async fn delete_records_where(&self, filter: &RecordFilter);

    async fn delete_all_records(&self);

    /// Count of records with exactly `latency`; `Unspecified` counts all.
    async fn get_record_count(&self, latency: EventLatency) -> usize;

    /// Bytes currently held.
    async fn get_size(&self) -> u64;

    /// Read-only snapshot. With `shutdown` reserved records are included.
    async fn get_records(&self, shutdown: bool, min_latency: EventLatency, max_count: usize) -> Vec<StorageRecord>;

    /// Trim to the configured size if needed. `true` when within the limit afterwards.
    async fn resize_db(&self) -> bool;

    /// An empty `value` deletes the setting.
    async fn store_setting(&self, name: &str, value: &str) -> bool;

    /// Empty string when absent.
    async fn get_setting(&self, name: &str) -> String;

    async fn delete_setting(&self, name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventPersistence;

    fn record(id: &str, blob_len: usize) -> StorageRecord {
        StorageRecord::with_timestamp(id, "t", EventLatency::Normal, EventPersistence::Normal, 1, vec![0; blob_len])
    }

    #[test]
    fn test_batch_respects_count() {
        let mut batch = RecordBatch::new().with_max_records(2);
        assert!(batch.accept(record("a", 1)));
        assert!(batch.accept(record("b", 1)));
        assert!(!batch.accept(record("c", 1)));
        assert_eq!(batch.ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_batch_respects_bytes_but_takes_first() {
        let mut batch = RecordBatch::new().with_max_bytes(10);
        assert!(batch.accept(record("big", 50)));
        assert!(!batch.accept(record("small", 1)));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        let mut sink = |r: StorageRecord| {
            seen.push(r.id);
            seen.len() < 2
        };
        assert!(sink.accept(record("a", 0)));
        assert!(!sink.accept(record("b", 0)));
        assert_eq!(seen.len(), 2);
    }
}
