// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One open durable database and the queries run against it.
//!
//! Writes accumulate in a retained transaction. Anything that reads, or
//! that must be visible to a concurrent reader of the file, commits it
//! first.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::record::{now_ms, EventLatency, EventPersistence, RecordFilter, StorageRecord, TenantCounts};
use crate::resilience::recovery::DatabaseLease;
use crate::storage::traits::{RecordSink, StorageError};

/// Ids per `IN (...)` list; keeps well under SQLite's bound-parameter cap.
const ID_CHUNK: usize = 500;

const RECORD_COLUMNS: &str = "id, tenant_token, priority, persistence, timestamp, blob, retry_count, reserved_until";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    /// The configured path (Default or Clean stage).
    File(PathBuf),
    /// Throwaway file, removed on close.
    Temp(PathBuf),
    Memory,
}

/// Outcome of one trim pass.
#[derive(Debug, Default)]
pub(crate) struct TrimReport {
    pub dropped: TenantCounts,
    pub size_after: u64,
}

pub(crate) struct Database {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    page_size: u64,
    location: Location,
    _lease: Option<DatabaseLease>,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn record_from_row(row: &SqliteRow) -> Result<StorageRecord, StorageError> {
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(StorageRecord {
        id: row.try_get("id")?,
        tenant_token: row.try_get("tenant_token")?,
        latency: EventLatency::from_stored(row.try_get("priority")?),
        persistence: EventPersistence::from_stored(row.try_get("persistence")?),
        timestamp: row.try_get("timestamp")?,
        blob: row.try_get::<Option<Vec<u8>>, _>("blob")?.unwrap_or_default(),
        retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
        reserved_until: row.try_get("reserved_until")?,
    })
}

impl Database {
    pub(crate) fn new(pool: SqlitePool, page_size: u64, location: Location, lease: Option<DatabaseLease>) -> Self {
        Self {
            pool,
            tx: None,
            page_size,
            location,
            _lease: lease,
        }
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }

    /// Commit the retained write transaction, if any.
    pub(crate) async fn commit(&mut self) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.take() {
            let start = Instant::now();
            tx.commit().await?;
            metrics::record_commit_duration(start.elapsed());
            trace!("Committed retained transaction");
        }
        Ok(())
    }

    /// Connection inside the retained write transaction, opening one if needed.
    async fn writer(&mut self) -> Result<&mut SqliteConnection, StorageError> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StorageError::NotOpen),
        }
    }

    /// Pool for reads; pending writes are committed first.
    async fn reader(&mut self) -> Result<&SqlitePool, StorageError> {
        self.commit().await?;
        Ok(&self.pool)
    }

    /// Insert or replace one record. Returns the database size afterwards,
    /// counting uncommitted pages.
    pub(crate) async fn insert(&mut self, record: &StorageRecord) -> Result<u64, StorageError> {
        let page_size = self.page_size;
        let conn = self.writer().await?;
        sqlx::query(
            "REPLACE INTO events (id, tenant_token, priority, persistence, timestamp, blob, retry_count, reserved_until) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&record.id)
        .bind(&record.tenant_token)
        .bind(record.latency.as_i32())
        .bind(record.persistence.as_i32())
        .bind(record.timestamp)
        .bind(&record.blob)
        .bind(i64::from(record.retry_count))
        .execute(&mut *conn)
        .await?;

        let pages: i64 = sqlx::query_scalar("PRAGMA page_count").fetch_one(&mut *conn).await?;
        Ok(pages.max(0) as u64 * page_size)
    }

    pub(crate) async fn size(&mut self) -> Result<u64, StorageError> {
        let page_size = self.page_size;
        let pool = self.reader().await?;
        let pages: i64 = sqlx::query_scalar("PRAGMA page_count").fetch_one(pool).await?;
        Ok(pages.max(0) as u64 * page_size)
    }

    /// Drop `percent` of the rows (at least one), lowest priority and oldest
    /// first, then give the freed pages back to the file system.
    pub(crate) async fn trim(&mut self, percent: u32) -> Result<TrimReport, StorageError> {
        self.commit().await?;
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events").fetch_one(&mut *tx).await?;
        let victims = (total * i64::from(percent) / 100).max(1);

        let rows = sqlx::query("SELECT id, tenant_token FROM events ORDER BY priority ASC, timestamp ASC LIMIT ?")
            .bind(victims)
            .fetch_all(&mut *tx)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        let mut dropped = TenantCounts::new();
        for row in &rows {
            ids.push(row.try_get::<String, _>("id")?);
            *dropped.entry(row.try_get::<String, _>("tenant_token")?).or_insert(0) += 1;
        }

        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!("DELETE FROM events WHERE id IN ({})", placeholders(chunk.len()));
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        sqlx::query("PRAGMA incremental_vacuum").execute(&self.pool).await?;
        let size_after = self.size().await?;
        debug!(dropped = ids.len(), total, size_after, "Trimmed durable tier");

        Ok(TrimReport { dropped, size_after })
    }

    /// Reclaim expired leases, then stream available records of the highest
    /// priority `>= min_latency` into `sink` and reserve the accepted ones.
    pub(crate) async fn reserve(
        &mut self,
        sink: &mut dyn RecordSink,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<usize, StorageError> {
        self.commit().await?;
        let now = now_ms();

        let reclaimed = sqlx::query(
            "UPDATE events SET reserved_until=0, retry_count=retry_count+1 WHERE reserved_until!=0 AND reserved_until<?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reclaimed > 0 {
            debug!(count = reclaimed, "Reclaimed expired durable reservations");
        }

        let floor = min_latency.floor().as_i32();
        let limit: i64 = if max_count == 0 { -1 } else { max_count as i64 };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM events \
             WHERE reserved_until=0 AND priority=(SELECT MAX(priority) FROM events WHERE reserved_until=0 AND priority>=?) \
             ORDER BY timestamp ASC LIMIT ?"
        );

        let mut tx = self.pool.begin().await?;
        let mut accepted = Vec::new();
        {
            let mut rows = sqlx::query(&sql).bind(floor).bind(limit).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await? {
                let record = record_from_row(&row)?;
                let id = record.id.clone();
                if !sink.accept(record) {
                    break;
                }
                accepted.push(id);
            }
        }

        if accepted.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let until = now.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        for chunk in accepted.chunks(ID_CHUNK) {
            let sql = format!("UPDATE events SET reserved_until=? WHERE id IN ({})", placeholders(chunk.len()));
            let mut query = sqlx::query(&sql).bind(until);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(accepted.len())
    }

    /// Clear reservations on `ids`. With `increment_retry_count`, rows over
    /// `max_retry_count` are deleted and their tenants returned.
    pub(crate) async fn release(
        &mut self,
        ids: &[String],
        increment_retry_count: bool,
        max_retry_count: u32,
    ) -> Result<TenantCounts, StorageError> {
        self.commit().await?;
        let mut tx = self.pool.begin().await?;
        let delta: i64 = if increment_retry_count { 1 } else { 0 };

        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "UPDATE events SET reserved_until=0, retry_count=retry_count+? WHERE id IN ({}) AND reserved_until>0",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(delta);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        let mut dropped = TenantCounts::new();
        if increment_retry_count {
            let tenants: Vec<String> = sqlx::query_scalar("SELECT tenant_token FROM events WHERE retry_count>?")
                .bind(i64::from(max_retry_count))
                .fetch_all(&mut *tx)
                .await?;
            if !tenants.is_empty() {
                sqlx::query("DELETE FROM events WHERE retry_count>?")
                    .bind(i64::from(max_retry_count))
                    .execute(&mut *tx)
                    .await?;
            }
            for tenant in tenants {
                *dropped.entry(tenant).or_insert(0) += 1;
            }
        }

        tx.commit().await?;
        Ok(dropped)
    }

    pub(crate) async fn delete(&mut self, ids: &[String]) -> Result<u64, StorageError> {
        let conn = self.writer().await?;
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!("DELETE FROM events WHERE id IN ({})", placeholders(chunk.len()));
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            deleted += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(deleted)
    }

    pub(crate) async fn delete_where(&mut self, filter: &RecordFilter) -> Result<u64, StorageError> {
        if filter.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM events WHERE 1=1");
        if let Some(id) = &filter.id {
            builder.push(" AND id = ").push_bind(id.clone());
        }
        if let Some(tenant) = &filter.tenant_token {
            builder.push(" AND tenant_token = ").push_bind(tenant.clone());
        }
        if let Some(latency) = filter.latency {
            builder.push(" AND priority = ").push_bind(latency.as_i32());
        }
        if let Some(persistence) = filter.persistence {
            builder.push(" AND persistence = ").push_bind(persistence.as_i32());
        }
        if let Some(retry_count) = filter.retry_count {
            builder.push(" AND retry_count = ").push_bind(i64::from(retry_count));
        }

        let conn = self.writer().await?;
        Ok(builder.build().execute(&mut *conn).await?.rows_affected())
    }

    pub(crate) async fn delete_all(&mut self) -> Result<u64, StorageError> {
        let conn = self.writer().await?;
        Ok(sqlx::query("DELETE FROM events").execute(&mut *conn).await?.rows_affected())
    }

    pub(crate) async fn count(&mut self, latency: EventLatency) -> Result<usize, StorageError> {
        let pool = self.reader().await?;
        let count: i64 = match latency {
            EventLatency::Unspecified => sqlx::query_scalar("SELECT COUNT(*) FROM events").fetch_one(pool).await?,
            concrete => {
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE priority=?")
                    .bind(concrete.as_i32())
                    .fetch_one(pool)
                    .await?
            }
        };
        Ok(count.max(0) as usize)
    }

    pub(crate) async fn records(
        &mut self,
        shutdown: bool,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StorageError> {
        let floor = min_latency.floor().as_i32();
        let limit: i64 = if max_count == 0 { -1 } else { max_count as i64 };
        let sql = if shutdown {
            format!(
                "SELECT {RECORD_COLUMNS} FROM events WHERE priority>=? \
                 ORDER BY priority DESC, timestamp ASC LIMIT ?"
            )
        } else {
            format!(
                "SELECT {RECORD_COLUMNS} FROM events \
                 WHERE reserved_until=0 AND priority=(SELECT MIN(priority) FROM events WHERE reserved_until=0 AND priority>=?) \
                 ORDER BY timestamp ASC LIMIT ?"
            )
        };

        let pool = self.reader().await?;
        let rows = sqlx::query(&sql).bind(floor).bind(limit).fetch_all(pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub(crate) async fn store_setting(&mut self, name: &str, value: &str) -> Result<(), StorageError> {
        let pool = self.reader().await?;
        sqlx::query("REPLACE INTO settings (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(value)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn get_setting(&mut self, name: &str) -> Result<Option<String>, StorageError> {
        let pool = self.reader().await?;
        let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE name=?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
        Ok(value.flatten())
    }

    pub(crate) async fn delete_setting(&mut self, name: &str) -> Result<(), StorageError> {
        let pool = self.reader().await?;
        sqlx::query("DELETE FROM settings WHERE name=?").bind(name).execute(pool).await?;
        Ok(())
    }

    /// Commit, close the pool, and remove throwaway files.
    pub(crate) async fn close(mut self) -> Result<(), StorageError> {
        let committed = self.commit().await;
        self.pool.close().await;
        if let Location::Temp(path) = &self.location {
            super::open::remove_database_files(path);
        }
        committed
    }

    /// Close without committing; used when the database is already failing.
    pub(crate) async fn abandon(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback of retained transaction failed");
            }
        }
        self.pool.close().await;
        if let Location::Temp(path) = &self.location {
            super::open::remove_database_files(path);
        }
    }
}
