// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Opening the durable tier down the recovery ladder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::database::{Database, Location};
use super::schema;
use crate::config::StorageConfig;
use crate::metrics;
use crate::resilience::recovery::{DatabaseRegistry, OpenStage};
use crate::resilience::retry::{is_transient, retry, RetryConfig};
use crate::storage::traits::{StorageError, StorageObserver};

/// Remove a database file and its WAL sidecars. Missing files are fine.
pub(crate) fn remove_database_files(path: &Path) {
    let mut sidecars = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        sidecars.push(PathBuf::from(name));
    }
    for file in sidecars {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %file.display(), error = %e, "Failed to remove database file"),
        }
    }
}

fn temp_database_path() -> PathBuf {
    std::env::temp_dir().join(format!("telemetry-cache-{}.db", Uuid::new_v4()))
}

async fn open_file(path: &Path, location: Location, config: &StorageConfig, registry: &DatabaseRegistry) -> Result<Database, StorageError> {
    let pool = schema::connect(schema::file_options(path)).await?;
    match schema::prepare(&pool, config).await {
        Ok(page_size) => {
            let lease = matches!(location, Location::File(_)).then(|| registry.acquire(path));
            Ok(Database::new(pool, page_size, location, lease))
        }
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

async fn open_memory(config: &StorageConfig) -> Result<Database, StorageError> {
    let pool = schema::connect(schema::memory_options()?).await?;
    let page_size = schema::prepare(&pool, config).await?;
    Ok(Database::new(pool, page_size, Location::Memory, None))
}

async fn open_stage(stage: OpenStage, config: &StorageConfig, registry: &DatabaseRegistry) -> Result<Database, StorageError> {
    let path = Path::new(&config.cache_file_path);
    match stage {
        OpenStage::Default => {
            retry(
                "sqlite_open",
                &RetryConfig::open(),
                |e: &StorageError| matches!(e, StorageError::Database(db) if is_transient(db)),
                || open_file(path, Location::File(path.to_path_buf()), config, registry),
            )
            .await
        }
        OpenStage::Clean => {
            if registry.holders(path) > 0 {
                return Err(StorageError::InUse(path.display().to_string()));
            }
            remove_database_files(path);
            open_file(path, Location::File(path.to_path_buf()), config, registry).await
        }
        OpenStage::Temp => {
            let temp = temp_database_path();
            let opened = open_file(&temp, Location::Temp(temp.clone()), config, registry).await;
            if opened.is_err() {
                remove_database_files(&temp);
            }
            opened
        }
        OpenStage::Memory => open_memory(config).await,
        OpenStage::None => Err(StorageError::NotOpen),
    }
}

/// Walk the ladder from `first` until a stage opens. Every failed stage is
/// reported through `on_storage_open_failed`; the stage that wins (or
/// `None`) through `on_storage_opened`.
pub(crate) async fn open_database(
    first: OpenStage,
    config: &StorageConfig,
    registry: &DatabaseRegistry,
    observer: &Arc<dyn StorageObserver>,
) -> (OpenStage, Option<Database>) {
    for stage in first.remaining() {
        match open_stage(stage, config, registry).await {
            Ok(db) => {
                info!(stage = %stage, location = ?db.location(), "Durable storage opened");
                metrics::set_open_stage(stage.as_u8());
                if stage != OpenStage::Default {
                    metrics::record_recovery(stage.description());
                }
                observer.on_storage_opened(stage.description());
                return (stage, Some(db));
            }
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed to open durable storage");
                metrics::record_error("sqlite", "open", stage.description());
                observer.on_storage_open_failed(&e.to_string());
            }
        }
    }

    error!("No database could be opened, durable storage disabled");
    metrics::set_open_stage(OpenStage::None.as_u8());
    observer.on_storage_opened(OpenStage::None.description());
    (OpenStage::None, None)
}
