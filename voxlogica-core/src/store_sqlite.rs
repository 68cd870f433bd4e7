//! Durable [`ContentStore`] backed by a single SQLite database file with a
//! rolling WAL journal.
//!
//! The on-disk schema is a compatibility contract: `records` keyed by
//! `(node_id, runtime_version)` and `leases` keyed the same way. A crash
//! mid-commit leaves either the pre-state or the post-state visible, never
//! a torn record; readers see committed rows only.

use crate::store::{
    BeginCompute, CommitOutcome, ContentStore, Lease, RecordFilter, RecordStatus, StoreRecord,
};
use crate::workplan::NodeId;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    node_id          TEXT    NOT NULL,
    runtime_version  TEXT    NOT NULL,
    status           TEXT    NOT NULL,
    payload_blob     BLOB,
    payload_bytes    INTEGER NOT NULL DEFAULT 0,
    error            TEXT,
    job_error        TEXT,
    runtime_metadata TEXT,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    PRIMARY KEY (node_id, runtime_version)
);

CREATE TABLE IF NOT EXISTS leases (
    node_id          TEXT    NOT NULL,
    runtime_version  TEXT    NOT NULL,
    owner            TEXT    NOT NULL,
    acquired_at      INTEGER NOT NULL,
    PRIMARY KEY (node_id, runtime_version)
);

CREATE INDEX IF NOT EXISTS idx_records_status ON records(status);
"#;

fn epoch_ms_to_datetime(epoch_ms: i64) -> DateTime<Utc> {
    let secs = epoch_ms.div_euclid(1000);
    let nanos = (epoch_ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoreRecord> {
    let node_hex: String = row.try_get("node_id")?;
    let status_raw: String = row.try_get("status")?;
    let payload: Option<Vec<u8>> = row.try_get("payload_blob")?;
    Ok(StoreRecord {
        node_id: NodeId::from_hex(&node_hex)
            .map_err(|e| anyhow!("corrupt node_id `{node_hex}`: {e}"))?,
        runtime_version: row.try_get("runtime_version")?,
        status: RecordStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("corrupt status `{status_raw}`"))?,
        created_at: epoch_ms_to_datetime(row.try_get("created_at")?),
        updated_at: epoch_ms_to_datetime(row.try_get("updated_at")?),
        payload_bytes: row.try_get::<i64, _>("payload_bytes")? as u64,
        payload,
        error: row.try_get("error")?,
        job_error: row.try_get("job_error")?,
    })
}

/// SQLite-backed store. One database file; readers never block writers
/// thanks to WAL.
pub struct SqliteStore {
    pool: SqlitePool,
    lease_ttl: Duration,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema.
    pub async fn open(path: &Path, lease_ttl: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open store database at {}", path.display()))?;
        let store = Self { pool, lease_ttl };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .context("apply store schema")?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn get(&self, node_id: NodeId, runtime_version: &str) -> Result<Option<StoreRecord>> {
        let row = sqlx::query(
            "SELECT node_id, runtime_version, status, payload_blob, payload_bytes,
                    error, job_error, created_at, updated_at
             FROM records WHERE node_id = ? AND runtime_version = ?",
        )
        .bind(node_id.to_hex())
        .bind(runtime_version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn begin_compute(
        &self,
        node_id: NodeId,
        runtime_version: &str,
        owner: &str,
        overwrite_failed: bool,
    ) -> Result<BeginCompute> {
        let node_hex = node_id.to_hex();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT node_id, runtime_version, status, payload_blob, payload_bytes,
                    error, job_error, created_at, updated_at
             FROM records WHERE node_id = ? AND runtime_version = ?",
        )
        .bind(&node_hex)
        .bind(runtime_version)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            let record = record_from_row(&row)?;
            match record.status {
                RecordStatus::Materialized => {
                    tx.commit().await?;
                    return Ok(BeginCompute::AlreadyComputed(record));
                }
                RecordStatus::Failed | RecordStatus::Killed if !overwrite_failed => {
                    tx.commit().await?;
                    return Ok(BeginCompute::AlreadyFailed(record));
                }
                // overwrite_failed: take a lease; commit replaces the row.
                RecordStatus::Failed | RecordStatus::Killed => {}
            }
        }

        let now = now_ms();
        let inserted = sqlx::query(
            "INSERT INTO leases (node_id, runtime_version, owner, acquired_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (node_id, runtime_version) DO NOTHING",
        )
        .bind(&node_hex)
        .bind(runtime_version)
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Key already leased. Reclaim if the holder looks crashed.
            let cutoff = now - self.lease_ttl.as_millis() as i64;
            let reclaimed = sqlx::query(
                "UPDATE leases SET owner = ?, acquired_at = ?
                 WHERE node_id = ? AND runtime_version = ? AND acquired_at < ?",
            )
            .bind(owner)
            .bind(now)
            .bind(&node_hex)
            .bind(runtime_version)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            if reclaimed.rows_affected() == 0 {
                tx.commit().await?;
                return Ok(BeginCompute::Contested);
            }
        }

        tx.commit().await?;
        Ok(BeginCompute::Lease(Lease {
            node_id,
            runtime_version: runtime_version.to_string(),
            owner: owner.to_string(),
        }))
    }

    async fn commit(&self, lease: Lease, outcome: CommitOutcome) -> Result<()> {
        let node_hex = lease.node_id.to_hex();
        let mut tx = self.pool.begin().await?;

        let holder: Option<String> = sqlx::query(
            "SELECT owner FROM leases WHERE node_id = ? AND runtime_version = ?",
        )
        .bind(&node_hex)
        .bind(&lease.runtime_version)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("owner"))
        .transpose()?;
        match holder {
            Some(owner) if owner == lease.owner => {}
            Some(_) => {
                return Err(anyhow!(
                    "lease for {} reclaimed by another owner",
                    lease.node_id
                ))
            }
            None => return Err(anyhow!("no lease held for {}", lease.node_id)),
        }

        let (status, payload, error) = match &outcome {
            CommitOutcome::Materialized(payload) => {
                (RecordStatus::Materialized, Some(payload.clone()), None)
            }
            CommitOutcome::Failed(error) => (RecordStatus::Failed, None, Some(error.clone())),
            CommitOutcome::Killed(error) => (RecordStatus::Killed, None, Some(error.clone())),
        };
        let now = now_ms();
        sqlx::query(
            "INSERT INTO records (node_id, runtime_version, status, payload_blob,
                                  payload_bytes, error, job_error, runtime_metadata,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
             ON CONFLICT (node_id, runtime_version) DO UPDATE SET
                 status = excluded.status,
                 payload_blob = excluded.payload_blob,
                 payload_bytes = excluded.payload_bytes,
                 error = excluded.error,
                 updated_at = excluded.updated_at",
        )
        .bind(&node_hex)
        .bind(&lease.runtime_version)
        .bind(status.as_str())
        .bind(payload.as_deref())
        .bind(payload.as_ref().map_or(0i64, |p| p.len() as i64))
        .bind(error.as_deref())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM leases WHERE node_id = ? AND runtime_version = ? AND owner = ?",
        )
        .bind(&node_hex)
        .bind(&lease.runtime_version)
        .bind(&lease.owner)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn abandon(&self, lease: Lease) -> Result<()> {
        sqlx::query(
            "DELETE FROM leases WHERE node_id = ? AND runtime_version = ? AND owner = ?",
        )
        .bind(lease.node_id.to_hex())
        .bind(&lease.runtime_version)
        .bind(&lease.owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn iter(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreRecord>> {
        let mut sql = String::from(
            "SELECT node_id, runtime_version, status, payload_blob, payload_bytes,
                    error, job_error, created_at, updated_at
             FROM records WHERE 1 = 1",
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.node_prefix.is_some() {
            sql.push_str(" AND node_id LIKE ? || '%'");
        }
        sql.push_str(" ORDER BY updated_at DESC, node_id LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(prefix) = &filter.node_prefix {
            query = query.bind(prefix.clone());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}
