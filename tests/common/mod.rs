//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use telemetry_cache::{
    EventLatency, EventPersistence, StorageConfig, StorageObserver, StorageRecord, TenantCounts,
};

/// Everything a storage reported, in arrival order per callback.
#[derive(Default)]
pub struct RecordingObserver {
    pub opened: Mutex<Vec<String>>,
    pub failed: Mutex<Vec<String>>,
    pub open_failed: Mutex<Vec<String>>,
    pub trimmed: Mutex<Vec<TenantCounts>>,
    pub dropped: Mutex<Vec<TenantCounts>>,
    pub rejected: Mutex<Vec<TenantCounts>>,
    pub saved: Mutex<Vec<usize>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_opened(&self) -> Option<String> {
        self.opened.lock().last().cloned()
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped.lock().iter().flat_map(|c| c.values()).sum()
    }

    pub fn trimmed_total(&self) -> usize {
        self.trimmed.lock().iter().flat_map(|c| c.values()).sum()
    }

    pub fn saved_total(&self) -> usize {
        self.saved.lock().iter().sum()
    }
}

impl StorageObserver for RecordingObserver {
    fn on_storage_opened(&self, description: &str) {
        self.opened.lock().push(description.to_string());
    }
    fn on_storage_failed(&self, reason: &str) {
        self.failed.lock().push(reason.to_string());
    }
    fn on_storage_open_failed(&self, reason: &str) {
        self.open_failed.lock().push(reason.to_string());
    }
    fn on_storage_trimmed(&self, counts: &TenantCounts) {
        self.trimmed.lock().push(counts.clone());
    }
    fn on_storage_records_dropped(&self, counts: &TenantCounts) {
        self.dropped.lock().push(counts.clone());
    }
    fn on_storage_records_rejected(&self, counts: &TenantCounts) {
        self.rejected.lock().push(counts.clone());
    }
    fn on_storage_records_saved(&self, count: usize) {
        self.saved.lock().push(count);
    }
}

/// Config pointing at `events.db` inside `dir`, commit timer off so tests
/// control when writes land.
pub fn config_in(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        cache_file_path: dir.path().join("events.db").display().to_string(),
        auto_commit_interval_ms: 0,
        ..Default::default()
    }
}

pub fn record(id: &str, latency: EventLatency, timestamp: i64) -> StorageRecord {
    StorageRecord::with_timestamp(id, "tenant-a", latency, EventPersistence::Normal, timestamp, vec![0xAB; 64])
}

pub fn record_with_blob(id: &str, blob_len: usize, timestamp: i64) -> StorageRecord {
    StorageRecord::with_timestamp(
        id,
        "tenant-a",
        EventLatency::Normal,
        EventPersistence::Normal,
        timestamp,
        vec![0x5A; blob_len],
    )
}
