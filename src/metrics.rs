// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the offline event cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host SDK is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_storage_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `tier`: memory, sqlite
//! - `operation`: store, reserve, release, delete, trim, settings
//! - `reason`: retry_limit, trim

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record records accepted by a tier
pub fn record_stored(tier: &str, count: usize) {
    counter!(
        "offline_storage_records_stored_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record records refused before reaching a tier
pub fn record_rejected(tier: &str, count: usize) {
    counter!(
        "offline_storage_records_rejected_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record records handed out under a lease
pub fn record_reserved(tier: &str, count: usize) {
    counter!(
        "offline_storage_records_reserved_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record records removed without delivery
pub fn record_dropped(tier: &str, reason: &str, count: usize) {
    counter!(
        "offline_storage_records_dropped_total",
        "tier" => tier.to_string(),
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Record records moved from the memory tier to the durable tier
pub fn record_migrated(count: usize, bytes: u64) {
    counter!("offline_storage_migrated_records_total").increment(count as u64);
    counter!("offline_storage_migrated_bytes_total").increment(bytes);
}

/// Set current memory tier size in bytes
pub fn set_memory_bytes(bytes: u64) {
    gauge!("offline_storage_memory_bytes").set(bytes as f64);
}

/// Set current durable tier size in bytes
pub fn set_database_bytes(bytes: u64) {
    gauge!("offline_storage_database_bytes").set(bytes as f64);
}

/// Set durable tier open stage (0 = Default, 1 = Clean, 2 = Temp, 3 = Memory, 4 = None)
pub fn set_open_stage(stage: u8) {
    gauge!("offline_storage_open_stage").set(stage as f64);
}

/// Record a recovery step taken after a database failure
pub fn record_recovery(stage: &str) {
    counter!(
        "offline_storage_recoveries_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "offline_storage_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_storage_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record retained-transaction commit duration
pub fn record_commit_duration(duration: Duration) {
    histogram!("offline_storage_commit_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($tier:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($tier, $op)
    };
}
