// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic telemetry-cache usage example.
//!
//! Demonstrates:
//! 1. Opening the tiered cache in a scratch directory
//! 2. Storing events of mixed latency
//! 3. One uploader cycle: reserve, "send", delete or release
//! 4. Persisting an upload cursor in the settings table
//! 5. Displaying metrics
//! 6. Clean shutdown (memory tier drained to disk)
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use telemetry_cache::{
    EventLatency, EventPersistence, OfflineStorage, OfflineStorageHandler, RecordBatch, StorageConfig,
    StorageObserver, StorageRecord, TenantCounts,
};

/// Prints every storage notification.
struct PrintingObserver;

impl StorageObserver for PrintingObserver {
    fn on_storage_opened(&self, description: &str) {
        println!("   └─ opened: {description}");
    }
    fn on_storage_failed(&self, reason: &str) {
        println!("   └─ failed: {reason}");
    }
    fn on_storage_open_failed(&self, reason: &str) {
        println!("   └─ open failed: {reason}");
    }
    fn on_storage_trimmed(&self, counts: &TenantCounts) {
        println!("   └─ trimmed: {counts:?}");
    }
    fn on_storage_records_dropped(&self, counts: &TenantCounts) {
        println!("   └─ dropped: {counts:?}");
    }
    fn on_storage_records_rejected(&self, counts: &TenantCounts) {
        println!("   └─ rejected: {counts:?}");
    }
    fn on_storage_records_saved(&self, count: usize) {
        println!("   └─ saved {count} records to disk");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n=== telemetry-cache: Basic Usage Example ===\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the cache
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let config = StorageConfig {
        cache_file_path: dir.path().join("events.db").display().to_string(),
        // Small memory tier so the demo shows migration to disk
        memory_queue_bytes: 4 * 1024,
        ..Default::default()
    };
    println!("Opening cache at {}", config.cache_file_path);

    let storage = OfflineStorageHandler::new(config);
    storage.initialize(Arc::new(PrintingObserver)).await;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Store events
    // ─────────────────────────────────────────────────────────────────────────
    println!("\nStoring 40 events...");
    for i in 0..40 {
        let latency = if i % 10 == 0 { EventLatency::RealTime } else { EventLatency::Normal };
        let event = StorageRecord::new(
            format!("event-{i:03}"),
            "demo-tenant",
            latency,
            EventPersistence::Normal,
            format!("{{\"name\":\"page_view\",\"seq\":{i}}}").into_bytes(),
        );
        storage.store_record(event).await;
    }
    println!(
        "   total: {} records, {} bytes",
        storage.get_record_count(EventLatency::Unspecified).await,
        storage.get_size().await
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. One uploader cycle
    // ─────────────────────────────────────────────────────────────────────────
    println!("\nUploading...");
    let mut uploads = 0;
    loop {
        let mut batch = RecordBatch::new().with_max_records(8).with_max_bytes(1024);
        storage
            .get_and_reserve_records(&mut batch, Duration::from_secs(30), EventLatency::Unspecified, 0)
            .await;
        if batch.is_empty() {
            break;
        }
        let tier = if storage.is_last_read_from_memory() { "memory" } else { "disk" };
        uploads += 1;

        // Pretend every third upload fails
        if uploads % 3 == 0 {
            println!("   └─ batch of {} from {tier}: failed, releasing", batch.len());
            storage.release_records(&batch.ids(), true).await;
            if uploads > 12 {
                break;
            }
        } else {
            println!("   └─ batch of {} from {tier}: sent", batch.len());
            storage.delete_records(&batch.ids()).await;
        }
    }
    println!(
        "   left after upload: {} records",
        storage.get_record_count(EventLatency::Unspecified).await
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Settings
    // ─────────────────────────────────────────────────────────────────────────
    storage.store_setting("upload.cursor", &uploads.to_string()).await;
    println!("\nSetting upload.cursor = {}", storage.get_setting("upload.cursor").await);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\nMetrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\nShutting down...");
    storage.shutdown().await;
    println!("Done.\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("   └─ {}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("{line}");
    }
}
