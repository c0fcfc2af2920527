//! In-process memory tier.
//!
//! One bucket per concrete latency, each kept sorted by ascending
//! timestamp (ties keep insertion order). Reserved records move out of their
//! bucket into a separate map keyed by id until released, deleted, or their
//! lease expires. Lock order is always buckets, then reservations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::traits::{null_observer, OfflineStorage, RecordSink, StorageObserver};
use crate::metrics;
use crate::record::{
    count_by_tenant, now_ms, EventLatency, RecordFilter, StorageRecord, TenantCounts,
};

const BUCKETS: usize = EventLatency::CONCRETE.len();
const TIER: &str = "memory";

type Buckets = [Vec<StorageRecord>; BUCKETS];

pub struct MemoryStorage {
    buckets: Mutex<Buckets>,
    reserved: Mutex<HashMap<String, StorageRecord>>,
    size: AtomicU64,
    last_read_count: AtomicUsize,
    max_retry_count: u32,
    observer: RwLock<Arc<dyn StorageObserver>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            buckets: Mutex::new(Default::default()),
            reserved: Mutex::new(HashMap::new()),
            size: AtomicU64::new(0),
            last_read_count: AtomicUsize::new(0),
            max_retry_count,
            observer: RwLock::new(null_observer()),
        }
    }

    fn observer(&self) -> Arc<dyn StorageObserver> {
        self.observer.read().clone()
    }

    /// Current accounted size in bytes (payload plus per-record overhead).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock();
        let reserved = self.reserved.lock();
        buckets.iter().map(Vec::len).sum::<usize>() + reserved.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_size(&self, bytes: u64) {
        let total = self.size.fetch_add(bytes, Ordering::AcqRel) + bytes;
        metrics::set_memory_bytes(total);
    }

    fn sub_size(&self, bytes: u64) {
        let mut current = self.size.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.size.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    metrics::set_memory_bytes(next);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn insert_sorted(bucket: &mut Vec<StorageRecord>, record: StorageRecord) {
        let pos = bucket.partition_point(|r| r.timestamp <= record.timestamp);
        bucket.insert(pos, record);
    }

    /// Take the one copy of `id`, wherever it sits.
    fn take_id(buckets: &mut Buckets, reserved: &mut HashMap<String, StorageRecord>, id: &str) -> Option<StorageRecord> {
        if let Some(record) = reserved.remove(id) {
            return Some(record);
        }
        buckets.iter_mut().find_map(|bucket| {
            let pos = bucket.iter().position(|r| r.id == id)?;
            Some(bucket.remove(pos))
        })
    }

    fn lease_deadline(now: i64, lease: Duration) -> i64 {
        now.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
    }

    fn bucket_of(buckets: &mut Buckets, latency: EventLatency) -> Option<&mut Vec<StorageRecord>> {
        latency.bucket().and_then(|i| buckets.get_mut(i))
    }

    /// Store one record, replacing any record with the same id. `Off`
    /// records are accepted and discarded.
    pub fn store(&self, record: StorageRecord) -> bool {
        if let Err(e) = record.validate() {
            warn!(id = %record.id, error = %e, "Rejecting invalid record");
            metrics::record_rejected(TIER, 1);
            self.observer().on_storage_failed("Invalid parameters");
            return false;
        }
        if record.latency == EventLatency::Off {
            trace!(id = %record.id, "Latency Off, not persisting");
            return true;
        }

        let bytes = record.estimated_size();
        let mut buckets = self.buckets.lock();
        let mut reserved = self.reserved.lock();
        if let Some(old) = Self::take_id(&mut buckets, &mut reserved, &record.id) {
            trace!(id = %old.id, "Replacing stored record");
            self.sub_size(old.estimated_size());
        }
        if let Some(bucket) = Self::bucket_of(&mut buckets, record.latency) {
            Self::insert_sorted(bucket, record);
        }
        // Size only changes with the bucket lock held
        self.add_size(bytes);
        drop(reserved);
        drop(buckets);
        metrics::record_stored(TIER, 1);
        true
    }

    /// Move reservations whose lease ran out back into their buckets.
    fn reclaim_expired(&self, buckets: &mut Buckets, reserved: &mut HashMap<String, StorageRecord>, now: i64) -> usize {
        let expired: Vec<String> = reserved
            .iter()
            .filter(|(_, r)| r.reserved_until != 0 && r.reserved_until < now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(mut record) = reserved.remove(id) {
                record.reserved_until = 0;
                record.retry_count = record.retry_count.saturating_add(1);
                if let Some(bucket) = Self::bucket_of(buckets, record.latency) {
                    Self::insert_sorted(bucket, record);
                }
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Reclaimed expired memory reservations");
        }
        expired.len()
    }

    /// Reserve the oldest records of the highest available latency.
    ///
    /// `sink` runs while the tier is locked and must not call back into it.
    pub fn reserve(&self, sink: &mut dyn RecordSink, lease: Duration, min_latency: EventLatency, max_count: usize) -> usize {
        let limit = if max_count == 0 { usize::MAX } else { max_count };
        let now = now_ms();
        let deadline = Self::lease_deadline(now, lease);

        let mut buckets = self.buckets.lock();
        let mut reserved = self.reserved.lock();
        self.reclaim_expired(&mut buckets, &mut reserved, now);

        let floor = min_latency.floor();
        let Some(bucket) = EventLatency::CONCRETE
            .iter()
            .rev()
            .filter(|l| **l >= floor)
            .filter_map(|l| l.bucket())
            .find(|i| !buckets[*i].is_empty())
        else {
            self.last_read_count.store(0, Ordering::Release);
            return 0;
        };

        let bucket = &mut buckets[bucket];
        let mut accepted = 0;
        for record in bucket.iter().take(limit) {
            if !sink.accept(record.clone()) {
                break;
            }
            accepted += 1;
        }

        for mut record in bucket.drain(..accepted) {
            record.reserved_until = deadline;
            reserved.insert(record.id.clone(), record);
        }

        self.last_read_count.store(accepted, Ordering::Release);
        if accepted > 0 {
            trace!(count = accepted, until = deadline, "Reserved memory records");
            metrics::record_reserved(TIER, accepted);
        }
        accepted
    }

    /// Clear reservations. Records over the retry limit are dropped.
    pub fn release(&self, ids: &[String], increment_retry_count: bool) -> usize {
        let mut dropped = Vec::new();
        let mut released = 0;
        {
            let mut buckets = self.buckets.lock();
            let mut reserved = self.reserved.lock();
            for id in ids {
                let Some(mut record) = reserved.remove(id) else {
                    continue;
                };
                released += 1;
                record.reserved_until = 0;
                if increment_retry_count {
                    record.retry_count = record.retry_count.saturating_add(1);
                }
                if record.retry_count > self.max_retry_count {
                    self.sub_size(record.estimated_size());
                    dropped.push(record);
                } else if let Some(bucket) = Self::bucket_of(&mut buckets, record.latency) {
                    Self::insert_sorted(bucket, record);
                }
            }
        }

        if !dropped.is_empty() {
            let counts = count_by_tenant(&dropped);
            warn!(count = dropped.len(), max_retry_count = self.max_retry_count, "Dropped records over retry limit");
            metrics::record_dropped(TIER, "retry_limit", dropped.len());
            self.observer().on_storage_records_dropped(&counts);
        }
        released
    }

    /// Put every reserved record back, retry counts unchanged.
    pub fn release_all(&self) -> usize {
        let mut buckets = self.buckets.lock();
        let mut reserved = self.reserved.lock();
        Self::unreserve_all(&mut buckets, &mut reserved)
    }

    fn unreserve_all(buckets: &mut Buckets, reserved: &mut HashMap<String, StorageRecord>) -> usize {
        let count = reserved.len();
        for (_, mut record) in reserved.drain() {
            record.reserved_until = 0;
            if let Some(bucket) = Self::bucket_of(buckets, record.latency) {
                Self::insert_sorted(bucket, record);
            }
        }
        count
    }

    /// Remove every record matching `predicate`, reserved or not.
    fn remove_matching(&self, mut predicate: impl FnMut(&StorageRecord) -> bool) -> Vec<StorageRecord> {
        let mut removed = Vec::new();
        let mut buckets = self.buckets.lock();
        let mut reserved = self.reserved.lock();
        for bucket in buckets.iter_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(bucket).into_iter().partition(|r| predicate(r));
            *bucket = kept;
            removed.extend(gone);
        }
        reserved.retain(|_, r| {
            if predicate(r) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        let bytes: u64 = removed.iter().map(StorageRecord::estimated_size).sum();
        self.sub_size(bytes);
        removed
    }

    pub fn delete(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let wanted: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.remove_matching(|r| wanted.contains(r.id.as_str())).len()
    }

    pub fn delete_where(&self, filter: &RecordFilter) -> usize {
        self.remove_matching(|r| filter.matches(r)).len()
    }

    pub fn delete_all(&self) -> usize {
        self.remove_matching(|_| true).len()
    }

    /// Count records of exactly `latency`; `Unspecified` counts all.
    #[must_use]
    pub fn count(&self, latency: EventLatency) -> usize {
        let buckets = self.buckets.lock();
        let reserved = self.reserved.lock();
        match latency.bucket() {
            None => buckets.iter().map(Vec::len).sum::<usize>() + reserved.len(),
            Some(i) => buckets[i].len() + reserved.values().filter(|r| r.latency == latency).count(),
        }
    }

    /// Copies of stored records; nothing is reserved or removed.
    #[must_use]
    pub fn snapshot(&self, shutdown: bool, min_latency: EventLatency, max_count: usize) -> Vec<StorageRecord> {
        let limit = if max_count == 0 { usize::MAX } else { max_count };
        let floor = min_latency.floor();
        let buckets = self.buckets.lock();
        let reserved = self.reserved.lock();

        if shutdown {
            let mut all: Vec<StorageRecord> = buckets
                .iter()
                .flatten()
                .chain(reserved.values())
                .filter(|r| r.latency >= floor)
                .cloned()
                .collect();
            all.sort_by(|a, b| b.latency.cmp(&a.latency).then(a.timestamp.cmp(&b.timestamp)));
            all.truncate(limit);
            return all;
        }

        EventLatency::CONCRETE
            .iter()
            .filter(|l| **l >= floor)
            .filter_map(|l| l.bucket())
            .find(|i| !buckets[*i].is_empty())
            .map(|i| buckets[i].iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Remove available records, lowest latency and oldest first, until at
    /// least `min_bytes` are freed. Ownership moves to the caller.
    pub fn take_oldest_lowest_priority(&self, min_bytes: u64) -> Vec<StorageRecord> {
        let mut taken = Vec::new();
        let mut freed = 0u64;
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            let mut n = 0;
            for record in bucket.iter() {
                if freed >= min_bytes {
                    break;
                }
                freed += record.estimated_size();
                n += 1;
            }
            taken.extend(bucket.drain(..n));
            if freed >= min_bytes {
                break;
            }
        }
        self.sub_size(freed);
        taken
    }

    /// Remove every record, reserved ones included.
    pub fn take_all(&self) -> Vec<StorageRecord> {
        let mut buckets = self.buckets.lock();
        let mut reserved = self.reserved.lock();
        Self::unreserve_all(&mut buckets, &mut reserved);
        let taken: Vec<StorageRecord> = buckets.iter_mut().flat_map(std::mem::take).collect();
        let bytes: u64 = taken.iter().map(StorageRecord::estimated_size).sum();
        self.sub_size(bytes);
        taken
    }

    fn unflushed_by_tenant(&self) -> TenantCounts {
        let buckets = self.buckets.lock();
        let reserved = self.reserved.lock();
        count_by_tenant(buckets.iter().flatten().chain(reserved.values()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(crate::StorageConfig::default().max_retry_count)
    }
}

#[async_trait]
impl OfflineStorage for MemoryStorage {
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) {
        *self.observer.write() = observer;
        self.observer().on_storage_opened("Memory/Default");
    }

    async fn shutdown(&self) {
        let unflushed = self.unflushed_by_tenant();
        for (tenant, count) in &unflushed {
            warn!(tenant = %tenant, count, "Discarding unflushed memory records");
        }
    }

    async fn flush(&self) {}

    async fn store_record(&self, record: StorageRecord) -> bool {
        self.store(record)
    }

    async fn get_and_reserve_records(
        &self,
        sink: &mut dyn RecordSink,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        self.reserve(sink, lease, min_latency, max_count);
        true
    }

    fn is_last_read_from_memory(&self) -> bool {
        true
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::Acquire)
    }

    async fn release_records(&self, ids: &[String], increment_retry_count: bool) {
        self.release(ids, increment_retry_count);
    }

    async fn release_all_records(&self) {
        self.release_all();
    }

    async fn delete_records(&self, ids: &[String]) {
        self.delete(ids);
    }

    async fn delete_records_where(&self, filter: &RecordFilter) {
        self.delete_where(filter);
    }

    async fn delete_all_records(&self) {
        self.delete_all();
    }

    async fn get_record_count(&self, latency: EventLatency) -> usize {
        self.count(latency)
    }

    async fn get_size(&self) -> u64 {
        self.size()
    }

    async fn get_records(&self, shutdown: bool, min_latency: EventLatency, max_count: usize) -> Vec<StorageRecord> {
        self.snapshot(shutdown, min_latency, max_count)
    }

    async fn resize_db(&self) -> bool {
        true
    }

    async fn store_setting(&self, _name: &str, _value: &str) -> bool {
        false
    }

    async fn get_setting(&self, _name: &str) -> String {
        String::new()
    }

    async fn delete_setting(&self, _name: &str) -> bool {
        false
    }
}
