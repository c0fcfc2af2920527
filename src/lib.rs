//! # Telemetry Cache
//!
//! Durable offline event cache for telemetry clients. Serialized events wait
//! here until an uploader reserves, sends and deletes them.
//!
//! ## Architecture
//!
//! Two tiers behind one contract, [`OfflineStorage`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  OfflineStorageHandler                      │
//! │  • Routes writes to the memory tier when enabled           │
//! │  • Reads memory first, durable tier when memory is empty   │
//! │  • Fans release / delete out to both tiers                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Memory tier                            │
//! │  • One timestamp-ordered bucket per latency                │
//! │  • Byte budget; overflow migrates oldest, lowest latency   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               (overflow, flush, shutdown drain)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SQLite durable tier                       │
//! │  • Retained write transaction, periodic commit             │
//! │  • Size ceiling enforced by trimming lowest latency first  │
//! │  • Recovery ladder: file → clean file → temp → in-memory   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telemetry_cache::{
//!     EventLatency, EventPersistence, NullObserver, OfflineStorage, OfflineStorageHandler,
//!     RecordBatch, StorageConfig, StorageRecord,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StorageConfig {
//!         cache_file_path: "/var/cache/app/events.db".into(),
//!         ..Default::default()
//!     };
//!
//!     let storage = OfflineStorageHandler::new(config);
//!     storage.initialize(Arc::new(NullObserver)).await;
//!
//!     let event = StorageRecord::new(
//!         "7f1c0c2e",
//!         "tenant-token",
//!         EventLatency::RealTime,
//!         EventPersistence::Critical,
//!         b"{\"name\":\"app_start\"}".to_vec(),
//!     );
//!     storage.store_record(event).await;
//!
//!     // Uploader: reserve, send, then delete on success or release on failure
//!     let mut batch = RecordBatch::new().with_max_records(50);
//!     storage
//!         .get_and_reserve_records(&mut batch, Duration::from_secs(60), EventLatency::Unspecified, 0)
//!         .await;
//!     storage.delete_records(&batch.ids()).await;
//!
//!     storage.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`handler`]: The [`OfflineStorageHandler`] multiplexing both tiers
//! - [`storage`]: The [`OfflineStorage`] contract, memory and SQLite tiers
//! - [`record`]: Stored records, latencies and filters
//! - [`resilience`]: Open retries, recovery ladder, database registry
//! - [`metrics`]: Counters and gauges via the `metrics` facade

pub mod config;
pub mod handler;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::StorageConfig;
pub use handler::OfflineStorageHandler;
pub use metrics::LatencyTimer;
pub use record::{
    now_ms, EventLatency, EventPersistence, RecordFilter, StorageRecord, TenantCounts, ValidationError,
};
pub use resilience::recovery::{DatabaseLease, DatabaseRegistry, OpenStage};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{
    NullObserver, OfflineStorage, RecordBatch, RecordSink, StorageError, StorageObserver,
};
pub use storage::{MemoryStorage, SqlStorage};
