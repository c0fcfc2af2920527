// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStorage;
pub use sqlite::SqlStorage;
pub use traits::{NullObserver, OfflineStorage, RecordBatch, RecordSink, StorageError, StorageObserver};
