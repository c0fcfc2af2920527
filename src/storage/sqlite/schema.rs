// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable tier schema and connection pragmas.
//!
//! ```sql
//! CREATE TABLE events (
//!   id TEXT PRIMARY KEY,
//!   tenant_token TEXT NOT NULL,
//!   priority INTEGER,          -- EventLatency discriminant
//!   persistence INTEGER,       -- EventPersistence discriminant
//!   timestamp INTEGER,
//!   blob BLOB,
//!   retry_count INTEGER DEFAULT 0,
//!   reserved_until INTEGER DEFAULT 0   -- lease deadline, epoch ms
//! );
//! CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT);
//! ```
//!
//! `PRAGMA user_version` is the schema gate: older versions are migrated in
//! place, newer ones are refused so the recovery chain recreates the file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::storage::traits::StorageError;

pub(crate) const CURRENT_SCHEMA_VERSION: i64 = 1;

const CREATE_EVENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        tenant_token TEXT NOT NULL,
        priority INTEGER,
        persistence INTEGER,
        timestamp INTEGER,
        blob BLOB,
        retry_count INTEGER DEFAULT 0,
        reserved_until INTEGER DEFAULT 0
    )
"#;

const CREATE_EVENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS k_priority_timestamp ON events (priority DESC, timestamp ASC)";

const CREATE_SETTINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT
    )
"#;

/// Connection options shared by file and in-memory databases.
///
/// sqlx applies `auto_vacuum` before `journal_mode`, which matters on a
/// fresh file.
fn with_pragmas(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .auto_vacuum(SqliteAutoVacuum::Incremental)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
}

pub(crate) fn file_options(path: &Path) -> SqliteConnectOptions {
    with_pragmas(SqliteConnectOptions::new().filename(path).create_if_missing(true))
}

pub(crate) fn memory_options() -> Result<SqliteConnectOptions, StorageError> {
    Ok(with_pragmas(SqliteConnectOptions::from_str("sqlite::memory:")?))
}

/// A pool pinned to one long-lived connection.
///
/// The retained write transaction and every read share that connection, and
/// an in-memory database lives exactly as long as it does.
pub(crate) async fn connect(options: SqliteConnectOptions) -> Result<SqlitePool, StorageError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Cap the journal, check the schema version, create missing tables, and
/// return the page size.
pub(crate) async fn prepare(pool: &SqlitePool, config: &StorageConfig) -> Result<u64, StorageError> {
    // PRAGMA arguments cannot be bound
    sqlx::query(&format!("PRAGMA journal_size_limit = {}", config.journal_size_limit_bytes))
        .execute(pool)
        .await?;

    let version: i64 = sqlx::query_scalar("PRAGMA user_version").fetch_one(pool).await?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::SchemaFromFuture {
            found: version,
            expected: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == 0 {
        debug!("No stored schema version, assuming fresh database");
    } else if version < CURRENT_SCHEMA_VERSION {
        info!(from = version, to = CURRENT_SCHEMA_VERSION, "Upgrading database schema");
    }

    sqlx::query(CREATE_EVENTS).execute(pool).await?;
    sqlx::query(CREATE_EVENTS_INDEX).execute(pool).await?;
    sqlx::query(CREATE_SETTINGS).execute(pool).await?;

    if version != CURRENT_SCHEMA_VERSION {
        sqlx::query(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION}"))
            .execute(pool)
            .await?;
    }

    let page_size: i64 = sqlx::query_scalar("PRAGMA page_size").fetch_one(pool).await?;
    Ok(page_size.max(0) as u64)
}
