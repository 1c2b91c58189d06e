//! Durable client-side queue of writes not yet confirmed by the server.
//!
//! Writes are FIFO per entity key. A key's oldest write blocks every later
//! write on the same key until it is acked or discarded, including while it
//! sits in the `failed` state waiting for the user.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeOp, EntityKind};
use crate::retry::Backoff;
use crate::time::now_ms;

const SELECT_COLUMNS: &str = "SELECT seq, kind, entity_id, op, payload, expected_version, client_ts, \
     attempts, status, next_attempt_at, last_error, created_at FROM pending_writes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Pending,
    Applying,
    Failed,
}

impl WriteStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WriteStatus::Pending => "pending",
            WriteStatus::Applying => "applying",
            WriteStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown write status: {0}")]
pub struct WriteStatusError(String);

impl FromStr for WriteStatus {
    type Err = WriteStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WriteStatus::Pending),
            "applying" => Ok(WriteStatus::Applying),
            "failed" => Ok(WriteStatus::Failed),
            other => Err(WriteStatusError(other.to_string())),
        }
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write as handed to [`PendingQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewWrite {
    pub kind: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub payload: Value,
    /// Version the user believed they were editing. `None` for creates.
    pub expected_version: Option<u64>,
    pub client_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWrite {
    pub seq: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub payload: Value,
    pub expected_version: Option<u64>,
    pub client_ts: i64,
    pub attempts: u32,
    pub status: WriteStatus,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

fn decode_column<T: FromStr>(field: &'static str, raw: &str) -> SyncResult<T>
where
    T::Err: fmt::Display,
{
    raw.parse()
        .map_err(|err: T::Err| SyncError::validation(field, err.to_string()))
}

fn row_to_write(row: &SqliteRow) -> SyncResult<PendingWrite> {
    let kind: String = row.try_get("kind")?;
    let op: String = row.try_get("op")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let expected: Option<i64> = row.try_get("expected_version")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(PendingWrite {
        seq: row.try_get("seq")?,
        kind: decode_column("kind", &kind)?,
        entity_id: row.try_get("entity_id")?,
        op: decode_column("op", &op)?,
        payload: serde_json::from_str(&payload)?,
        expected_version: expected.and_then(|v| u64::try_from(v).ok()),
        client_ts: row.try_get("client_ts")?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        status: decode_column("status", &status)?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct PendingQueue {
    pool: SqlitePool,
    backoff: Backoff,
    max_attempts: u32,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool, config: &SyncConfig) -> Self {
        Self {
            pool,
            backoff: config.backoff(),
            max_attempts: config.queue_max_attempts.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn enqueue(&self, write: NewWrite) -> SyncResult<i64> {
        let now = now_ms();
        let res = sqlx::query(
            "INSERT INTO pending_writes (kind, entity_id, op, payload, expected_version, client_ts, next_attempt_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(write.kind.as_str())
        .bind(&write.entity_id)
        .bind(write.op.as_str())
        .bind(serde_json::to_string(&write.payload)?)
        .bind(write.expected_version.map(|v| v as i64))
        .bind(write.client_ts)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let seq = res.last_insert_rowid();
        debug!(target: "plantkeeper", event = "queue_enqueue", seq, kind = %write.kind, id = %write.entity_id, op = %write.op);
        Ok(seq)
    }

    /// Oldest write of each key whose predecessors are all gone and whose
    /// backoff has elapsed, in sequence order.
    pub async fn peek_ready(&self, now: i64, limit: u32) -> SyncResult<Vec<PendingWrite>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE seq IN \
               (SELECT MIN(seq) FROM pending_writes GROUP BY kind, entity_id) \
             AND status = 'pending' AND next_attempt_at <= ? \
             ORDER BY seq LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_write).collect()
    }

    /// Claim a write for dispatch. False when it is no longer pending.
    pub async fn mark_applying(&self, seq: i64) -> SyncResult<bool> {
        let res = sqlx::query(
            "UPDATE pending_writes SET status = 'applying' WHERE seq = ? AND status = 'pending'",
        )
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Remove a write the server confirmed.
    pub async fn ack(&self, seq: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_writes WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        debug!(target: "plantkeeper", event = "queue_ack", seq);
        Ok(())
    }

    /// Count a failed attempt. The write is rescheduled with capped
    /// exponential backoff, or parked as `failed` once its budget is spent.
    pub async fn fail(&self, seq: i64, error: &str, now: i64) -> SyncResult<WriteStatus> {
        let attempts: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM pending_writes WHERE seq = ?")
                .bind(seq)
                .fetch_optional(&self.pool)
                .await?;
        let Some(attempts) = attempts else {
            return Err(SyncError::validation("seq", format!("no pending write #{seq}")));
        };
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX).saturating_add(1);
        let status = if attempts >= self.max_attempts {
            WriteStatus::Failed
        } else {
            WriteStatus::Pending
        };
        let next_attempt_at = self.backoff.next_at(now, attempts);
        sqlx::query(
            "UPDATE pending_writes SET attempts = ?, status = ?, next_attempt_at = ?, last_error = ? WHERE seq = ?",
        )
        .bind(i64::from(attempts))
        .bind(status.as_str())
        .bind(next_attempt_at)
        .bind(error)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        if status == WriteStatus::Failed {
            warn!(target: "plantkeeper", event = "queue_write_failed", seq, attempts, error = %error);
        } else {
            debug!(target: "plantkeeper", event = "queue_retry_scheduled", seq, attempts, next_attempt_at);
        }
        Ok(status)
    }

    /// Park a write as `failed` without spending retries, for conflicts
    /// only the user can settle.
    pub async fn mark_failed(&self, seq: i64, error: &str) -> SyncResult<()> {
        sqlx::query("UPDATE pending_writes SET status = 'failed', last_error = ? WHERE seq = ?")
            .bind(error)
            .bind(seq)
            .execute(&self.pool)
            .await?;
        warn!(target: "plantkeeper", event = "queue_write_failed", seq, error = %error);
        Ok(())
    }

    /// Return writes stranded in `applying` by a crash to `pending`.
    pub async fn recover(&self) -> SyncResult<u64> {
        let res = sqlx::query("UPDATE pending_writes SET status = 'pending' WHERE status = 'applying'")
            .execute(&self.pool)
            .await?;
        if res.rows_affected() > 0 {
            info!(target: "plantkeeper", event = "queue_recovered", count = res.rows_affected());
        }
        Ok(res.rows_affected())
    }

    /// Point later writes on a key at the version the server just confirmed.
    pub async fn rebase(&self, kind: EntityKind, id: &str, from: u64, to: u64) -> SyncResult<u64> {
        let res = sqlx::query(
            "UPDATE pending_writes SET expected_version = ? \
             WHERE kind = ? AND entity_id = ? AND expected_version = ?",
        )
        .bind(to as i64)
        .bind(kind.as_str())
        .bind(id)
        .bind(from as i64)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Drop a write on the user's behalf. Returns the dropped write.
    pub async fn discard(&self, seq: i64) -> SyncResult<Option<PendingWrite>> {
        let Some(write) = self.get(seq).await? else {
            return Ok(None);
        };
        self.ack(seq).await?;
        info!(target: "plantkeeper", event = "queue_discard", seq, kind = %write.kind, id = %write.entity_id);
        Ok(Some(write))
    }

    /// Give a failed write a fresh retry budget.
    pub async fn retry_failed(&self, seq: i64) -> SyncResult<bool> {
        let res = sqlx::query(
            "UPDATE pending_writes SET status = 'pending', attempts = 0, next_attempt_at = ?, last_error = NULL \
             WHERE seq = ? AND status = 'failed'",
        )
        .bind(now_ms())
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get(&self, seq: i64) -> SyncResult<Option<PendingWrite>> {
        let sql = format!("{SELECT_COLUMNS} WHERE seq = ?");
        let row = sqlx::query(&sql).bind(seq).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_write).transpose()
    }

    pub async fn len(&self) -> SyncResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_writes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn list(&self) -> SyncResult<Vec<PendingWrite>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY seq");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_write).collect()
    }

    /// Writes still queued behind `seq` on the same key.
    pub async fn pending_after(&self, kind: EntityKind, id: &str, seq: i64) -> SyncResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_writes WHERE kind = ? AND entity_id = ? AND seq > ?",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
