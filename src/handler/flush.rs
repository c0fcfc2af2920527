//! Moving records from the memory tier to the durable tier.
//!
//! Three triggers: overflow before a write, an explicit flush, and the
//! shutdown drain. Ownership moves out of memory first, so a record is never
//! reservable from both tiers at once.

use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::record::{count_by_tenant, StorageRecord};
use crate::storage::traits::OfflineStorage;
use crate::storage::MemoryStorage;

use super::OfflineStorageHandler;

impl OfflineStorageHandler {
    /// Make room for `incoming` bytes in the memory tier.
    ///
    /// Frees at least the overflow, and at least a quarter of the budget so
    /// a steady stream of writes does not migrate one record at a time.
    pub(super) async fn make_room(&self, memory: &MemoryStorage, incoming: u64) {
        let limit = self.config.memory_queue_bytes;
        if memory.size() + incoming <= limit {
            return;
        }

        let _guard = self.migration.lock().await;
        let current = memory.size();
        if current + incoming <= limit {
            return;
        }

        let excess = current + incoming - limit;
        let target = excess.max(limit / 4);
        let batch = memory.take_oldest_lowest_priority(target);
        debug!(current, incoming, limit, records = batch.len(), "Memory tier over budget, migrating");
        self.migrate(batch, "overflow").await;
    }

    /// Store `records` in the durable tier. Records it refuses are reported
    /// as dropped. Returns how many were saved.
    pub(super) async fn migrate(&self, records: Vec<StorageRecord>, reason: &'static str) -> usize {
        if records.is_empty() {
            return 0;
        }

        let total = records.len();
        let mut bytes = 0u64;
        let mut refused = Vec::new();
        for record in records {
            let size = record.estimated_size();
            if self.durable.store_record(record.clone()).await {
                bytes += size;
            } else {
                refused.push(record);
            }
        }

        let saved = total - refused.len();
        if saved > 0 {
            metrics::record_migrated(saved, bytes);
            self.observer().on_storage_records_saved(saved);
        }
        if !refused.is_empty() {
            let counts = count_by_tenant(&refused);
            warn!(reason, refused = refused.len(), "Durable tier refused migrated records");
            metrics::record_dropped("handler", "migration", refused.len());
            self.observer().on_storage_records_dropped(&counts);
        }

        debug!(reason, saved, bytes, "Migrated memory records");
        saved
    }

    /// Move every available memory record to the durable tier.
    /// Reserved records stay with their uploader.
    pub(super) async fn flush_memory(&self) -> usize {
        let Some(memory) = self.memory.clone() else {
            return 0;
        };
        let _guard = self.migration.lock().await;
        let batch = memory.take_oldest_lowest_priority(u64::MAX);
        self.migrate(batch, "flush").await
    }

    /// Clear memory reservations and move everything to the durable tier.
    pub(super) async fn drain_memory(&self) -> usize {
        let Some(memory) = self.memory.clone() else {
            return 0;
        };
        let _guard = self.migration.lock().await;
        let released = memory.release_all();
        let batch = memory.take_all();
        let count = batch.len();
        let saved = self.migrate(batch, "shutdown").await;
        if count > 0 {
            info!(released, drained = count, saved, "Drained memory tier to durable storage");
        }
        self.last_read_from_memory.store(false, Ordering::Release);
        saved
    }
}
