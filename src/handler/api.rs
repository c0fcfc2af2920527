//! [`OfflineStorage`] for the tier multiplexer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::record::{EventLatency, RecordFilter, StorageRecord};
use crate::storage::traits::{OfflineStorage, RecordSink, StorageObserver};

use super::OfflineStorageHandler;

#[async_trait]
impl OfflineStorage for OfflineStorageHandler {
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) {
        self.open(observer).await;
    }

    async fn shutdown(&self) {
        self.close().await;
    }

    /// Move available memory records down, then commit the durable tier.
    async fn flush(&self) {
        self.flush_memory().await;
        self.durable.flush().await;
    }

    async fn store_record(&self, record: StorageRecord) -> bool {
        if self.closed.load(Ordering::Acquire) {
            trace!(id = %record.id, "Handler closed, refusing record");
            return false;
        }
        match &self.memory {
            Some(memory) => {
                if record.validate().is_ok() && record.latency != EventLatency::Off {
                    // Drop any copy of this id that already migrated
                    self.durable.delete_records(std::slice::from_ref(&record.id)).await;
                    self.make_room(memory, record.estimated_size()).await;
                }
                memory.store(record)
            }
            None => self.durable.store_record(record).await,
        }
    }

    async fn get_and_reserve_records(
        &self,
        sink: &mut dyn RecordSink,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        if let Some(memory) = &self.memory {
            let reserved = memory.reserve(sink, lease, min_latency, max_count);
            if reserved > 0 {
                self.last_read_from_memory.store(true, Ordering::Release);
                self.last_read_count.store(reserved, Ordering::Release);
                return true;
            }
        }

        let ok = self.durable.get_and_reserve_records(sink, lease, min_latency, max_count).await;
        self.last_read_from_memory.store(false, Ordering::Release);
        self.last_read_count
            .store(self.durable.last_read_record_count(), Ordering::Release);
        ok
    }

    fn is_last_read_from_memory(&self) -> bool {
        self.last_read_from_memory.load(Ordering::Acquire)
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::Acquire)
    }

    async fn release_records(&self, ids: &[String], increment_retry_count: bool) {
        let released = self.memory.as_ref().map_or(0, |m| m.release(ids, increment_retry_count));
        if released < ids.len() {
            self.durable.release_records(ids, increment_retry_count).await;
        }
    }

    async fn release_all_records(&self) {
        if let Some(memory) = &self.memory {
            memory.release_all();
        }
    }

    async fn delete_records(&self, ids: &[String]) {
        let deleted = self.memory.as_ref().map_or(0, |m| m.delete(ids));
        if deleted < ids.len() {
            self.durable.delete_records(ids).await;
        }
    }

    async fn delete_records_where(&self, filter: &RecordFilter) {
        if let Some(memory) = &self.memory {
            memory.delete_where(filter);
        }
        self.durable.delete_records_where(filter).await;
    }

    async fn delete_all_records(&self) {
        if let Some(memory) = &self.memory {
            memory.delete_all();
        }
        self.durable.delete_all_records().await;
    }

    async fn get_record_count(&self, latency: EventLatency) -> usize {
        let in_memory = self.memory.as_ref().map_or(0, |m| m.count(latency));
        in_memory + self.durable.get_record_count(latency).await
    }

    async fn get_size(&self) -> u64 {
        let in_memory = self.memory.as_ref().map_or(0, |m| m.size());
        in_memory + self.durable.get_size().await
    }

    async fn get_records(&self, shutdown: bool, min_latency: EventLatency, max_count: usize) -> Vec<StorageRecord> {
        let mut records = self
            .memory
            .as_ref()
            .map(|m| m.snapshot(shutdown, min_latency, max_count))
            .unwrap_or_default();
        if !shutdown {
            if records.is_empty() {
                records = self.durable.get_records(false, min_latency, max_count).await;
            }
            return records;
        }

        records.extend(self.durable.get_records(true, min_latency, max_count).await);
        records.sort_by(|a, b| b.latency.cmp(&a.latency).then(a.timestamp.cmp(&b.timestamp)));
        if max_count != 0 {
            records.truncate(max_count);
        }
        records
    }

    async fn resize_db(&self) -> bool {
        self.durable.resize_db().await
    }

    async fn store_setting(&self, name: &str, value: &str) -> bool {
        self.durable.store_setting(name, value).await
    }

    async fn get_setting(&self, name: &str) -> String {
        self.durable.get_setting(name).await
    }

    async fn delete_setting(&self, name: &str) -> bool {
        self.durable.delete_setting(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::record::{EventPersistence, TenantCounts};
    use crate::resilience::recovery::DatabaseRegistry;
    use crate::storage::traits::RecordBatch;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Saved {
        saved: Mutex<usize>,
        dropped: Mutex<usize>,
    }

    impl StorageObserver for Saved {
        fn on_storage_opened(&self, _description: &str) {}
        fn on_storage_failed(&self, _reason: &str) {}
        fn on_storage_open_failed(&self, _reason: &str) {}
        fn on_storage_trimmed(&self, _counts: &TenantCounts) {}
        fn on_storage_records_dropped(&self, counts: &TenantCounts) {
            *self.dropped.lock() += counts.values().sum::<usize>();
        }
        fn on_storage_records_rejected(&self, _counts: &TenantCounts) {}
        fn on_storage_records_saved(&self, count: usize) {
            *self.saved.lock() += count;
        }
    }

    fn config_in(dir: &TempDir, memory_queue_bytes: u64) -> StorageConfig {
        StorageConfig {
            cache_file_path: dir.path().join("events.db").display().to_string(),
            memory_queue_bytes,
            auto_commit_interval_ms: 0,
            ..Default::default()
        }
    }

    fn record(id: &str, latency: EventLatency, ts: i64) -> StorageRecord {
        StorageRecord::with_timestamp(id, "tenant", latency, EventPersistence::Normal, ts, vec![7; 100])
    }

    async fn open_handler(config: StorageConfig) -> (OfflineStorageHandler, Arc<Saved>) {
        let observer = Arc::new(Saved::default());
        let handler = OfflineStorageHandler::with_registry(config, DatabaseRegistry::new());
        handler.initialize(observer.clone()).await;
        (handler, observer)
    }

    #[tokio::test]
    async fn test_store_lands_in_memory_first() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        assert!(handler.store_record(record("a", EventLatency::Normal, 1)).await);
        assert_eq!(handler.memory().unwrap().len(), 1);
        assert_eq!(handler.durable().get_record_count(EventLatency::Unspecified).await, 0);
        assert_eq!(handler.get_record_count(EventLatency::Unspecified).await, 1);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_replaces_migrated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        handler.durable().store_record(record("a", EventLatency::Normal, 1)).await;
        assert!(handler.store_record(record("a", EventLatency::Normal, 2)).await);
        assert!(handler.store_record(record("a", EventLatency::Normal, 3)).await);

        assert_eq!(handler.durable().get_record_count(EventLatency::Unspecified).await, 0);
        assert_eq!(handler.get_record_count(EventLatency::Unspecified).await, 1);
        assert_eq!(handler.memory().unwrap().size(), record("a", EventLatency::Normal, 3).estimated_size());

        let mut batch = RecordBatch::new();
        handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].timestamp, 3);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_migrates_oldest_to_durable() {
        let dir = tempfile::tempdir().unwrap();
        let one = record("r00", EventLatency::Normal, 1).estimated_size();
        let (handler, observer) = open_handler(config_in(&dir, one * 4)).await;

        for i in 0..6 {
            assert!(handler.store_record(record(&format!("r{i:02}"), EventLatency::Normal, i + 1)).await);
        }

        let memory = handler.memory().unwrap();
        assert!(memory.size() <= one * 4);
        let migrated = handler.durable().get_record_count(EventLatency::Unspecified).await;
        assert!(migrated >= 2);
        assert_eq!(*observer.saved.lock(), migrated);
        assert_eq!(handler.get_record_count(EventLatency::Unspecified).await, 6);

        let oldest = handler.durable().get_records(false, EventLatency::Unspecified, 1).await;
        assert_eq!(oldest[0].id, "r00");

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_reserve_prefers_memory_then_durable() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        handler.durable().store_record(record("disk", EventLatency::Normal, 1)).await;
        handler.store_record(record("mem", EventLatency::Normal, 2)).await;

        let mut batch = RecordBatch::new();
        assert!(handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await);
        assert_eq!(batch.ids(), vec!["mem".to_string()]);
        assert!(handler.is_last_read_from_memory());
        assert_eq!(handler.last_read_record_count(), 1);

        let mut batch = RecordBatch::new();
        assert!(handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await);
        assert_eq!(batch.ids(), vec!["disk".to_string()]);
        assert!(!handler.is_last_read_from_memory());
        assert_eq!(handler.last_read_record_count(), 1);

        handler.delete_records(&["mem".to_string(), "disk".to_string()]).await;
        assert_eq!(handler.get_record_count(EventLatency::Unspecified).await, 0);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_memory_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 0)).await;

        assert!(handler.store_record(record("a", EventLatency::RealTime, 1)).await);
        assert_eq!(handler.durable().get_record_count(EventLatency::RealTime).await, 1);

        let mut batch = RecordBatch::new();
        handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await;
        assert!(!handler.is_last_read_from_memory());
        handler.release_records(&batch.ids(), true).await;

        let stored = handler.get_records(true, EventLatency::Unspecified, 0).await;
        assert_eq!(stored[0].retry_count, 1);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_memory_and_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir, 64 * 1024);
        let (handler, observer) = open_handler(config.clone()).await;

        handler.store_record(record("a", EventLatency::Normal, 1)).await;
        handler.store_record(record("b", EventLatency::Max, 2)).await;
        let mut batch = RecordBatch::new();
        handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await;
        assert_eq!(batch.ids(), vec!["b".to_string()]);

        handler.shutdown().await;
        handler.shutdown().await;
        assert_eq!(*observer.saved.lock(), 2);
        assert!(!handler.store_record(record("c", EventLatency::Normal, 3)).await);

        let (reopened, _) = open_handler(config).await;
        let records = reopened.get_records(true, EventLatency::Unspecified, 0).await;
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(records.iter().all(|r| r.reserved_until == 0));
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_records_combines_tiers_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        handler.durable().store_record(record("disk", EventLatency::RealTime, 5)).await;
        handler.store_record(record("mem", EventLatency::Normal, 1)).await;

        let normal = handler.get_records(false, EventLatency::Unspecified, 0).await;
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].id, "mem");

        let all = handler.get_records(true, EventLatency::Unspecified, 0).await;
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["disk", "mem"]);

        let capped = handler.get_records(true, EventLatency::Unspecified, 1).await;
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "disk");

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_moves_available_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        handler.store_record(record("held", EventLatency::Max, 1)).await;
        handler.store_record(record("free", EventLatency::Normal, 2)).await;
        let mut batch = RecordBatch::new();
        handler.get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0).await;
        assert_eq!(batch.ids(), vec!["held".to_string()]);

        handler.flush().await;
        assert_eq!(handler.memory().unwrap().len(), 1);
        assert_eq!(handler.durable().get_record_count(EventLatency::Normal).await, 1);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_settings_live_in_durable_tier() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = open_handler(config_in(&dir, 64 * 1024)).await;

        assert!(handler.store_setting("last_upload", "42").await);
        assert_eq!(handler.durable().get_setting("last_upload").await, "42");
        assert!(handler.delete_setting("last_upload").await);
        assert_eq!(handler.get_setting("last_upload").await, "");

        handler.shutdown().await;
    }
}
