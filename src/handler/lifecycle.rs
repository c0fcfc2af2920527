//! Handler startup and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::storage::traits::{OfflineStorage, StorageObserver};

use super::OfflineStorageHandler;

impl OfflineStorageHandler {
    /// Open both tiers. Both report through the same observer.
    #[instrument(skip_all, fields(path = %self.config.cache_file_path))]
    pub(super) async fn open(&self, observer: Arc<dyn StorageObserver>) {
        *self.observer.write() = observer.clone();
        if let Some(memory) = &self.memory {
            memory.initialize(observer.clone()).await;
        }
        self.durable.initialize(observer).await;
        self.closed.store(false, Ordering::Release);

        info!(
            memory_queue_bytes = self.config.memory_queue_bytes,
            max_storage_bytes = self.config.max_storage_bytes,
            "Offline storage handler initialized"
        );
    }

    /// Drain memory into the durable tier, then close both.
    /// Only the first call does any work.
    #[instrument(skip_all, fields(path = %self.config.cache_file_path))]
    pub(super) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down offline storage handler");

        self.drain_memory().await;
        self.durable.shutdown().await;
        if let Some(memory) = &self.memory {
            memory.shutdown().await;
        }

        info!("Offline storage handler shutdown complete");
    }
}
