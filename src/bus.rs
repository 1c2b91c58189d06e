//! At-least-once change-event delivery.
//!
//! [`OutboxBus`] reads the `change_log` table the authoritative store writes
//! in the same transaction as each entity write. Only the oldest outstanding
//! event per entity key is handed out, so one key is never processed out of
//! version order while different keys proceed independently.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeOp, EntityKind};
use crate::time::now_ms;

/// How long a polled event stays invisible to other pollers before it is
/// handed out again.
pub const DEFAULT_LEASE_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub version: u64,
    pub payload: Value,
    pub created_at: i64,
}

/// One hand-out of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub event: ChangeEvent,
    /// 1 on first delivery.
    pub attempt: u32,
    /// Version a handler saw when it last failed with a stale write.
    pub observed_version: Option<u64>,
}

impl Delivery {
    /// Version the handler should write against.
    pub fn expected_version(&self) -> u64 {
        self.observed_version.unwrap_or(self.event.version)
    }

    pub fn key(&self) -> (EntityKind, &str) {
        (self.event.kind, self.event.entity_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub event: ChangeEvent,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dead_at: i64,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Claim up to `limit` deliverable events, at most one per entity key.
    async fn poll(&self, limit: u32, now: i64) -> SyncResult<Vec<Delivery>>;

    async fn ack(&self, seq: i64) -> SyncResult<()>;

    /// Release an event for redelivery at `retry_at`.
    async fn nack(
        &self,
        seq: i64,
        error: &str,
        retry_at: i64,
        observed_version: Option<u64>,
    ) -> SyncResult<()>;

    /// Stop delivering an event. Later events on the same key become eligible.
    async fn dead_letter(&self, seq: i64, error: &str) -> SyncResult<()>;
}

#[derive(Clone)]
pub struct OutboxBus {
    pool: SqlitePool,
    lease_ms: i64,
}

fn row_to_event(row: &SqliteRow) -> SyncResult<ChangeEvent> {
    let kind: String = row.try_get("kind")?;
    let op: String = row.try_get("op")?;
    let payload: String = row.try_get("payload")?;
    let version: i64 = row.try_get("version")?;
    Ok(ChangeEvent {
        seq: row.try_get("seq")?,
        kind: kind
            .parse()
            .map_err(|err| SyncError::validation("kind", format!("{err}")))?,
        entity_id: row.try_get("entity_id")?,
        op: op
            .parse()
            .map_err(|err| SyncError::validation("op", format!("{err}")))?,
        version: u64::try_from(version).unwrap_or_default(),
        payload: serde_json::from_str(&payload)?,
        created_at: row.try_get("created_at")?,
    })
}

fn to_u32(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(u32::MAX)
}

impl OutboxBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lease_ms: DEFAULT_LEASE_MS,
        }
    }

    pub fn with_lease(mut self, lease_ms: i64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    /// Events neither delivered nor dead-lettered.
    pub async fn backlog(&self) -> SyncResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_log WHERE delivered_at IS NULL AND dead_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT seq, kind, entity_id, op, version, payload, created_at, attempts, last_error, dead_at \
             FROM change_log WHERE dead_at IS NOT NULL ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    event: row_to_event(row)?,
                    attempts: to_u32(row.try_get("attempts")?),
                    last_error: row.try_get("last_error")?,
                    dead_at: row.try_get("dead_at")?,
                })
            })
            .collect()
    }

    /// Events recorded for one entity, oldest first, whatever their state.
    pub async fn history(&self, kind: EntityKind, id: &str) -> SyncResult<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            "SELECT seq, kind, entity_id, op, version, payload, created_at \
             FROM change_log WHERE kind = ? AND entity_id = ? ORDER BY seq",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl EventBus for OutboxBus {
    async fn poll(&self, limit: u32, now: i64) -> SyncResult<Vec<Delivery>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT c.seq, c.kind, c.entity_id, c.op, c.version, c.payload, c.created_at, \
                    c.attempts, c.redeliver_version \
             FROM change_log c \
             JOIN (SELECT MIN(seq) AS head FROM change_log \
                   WHERE delivered_at IS NULL AND dead_at IS NULL \
                   GROUP BY kind, entity_id) h ON c.seq = h.head \
             WHERE c.available_at <= ? \
             ORDER BY c.seq \
             LIMIT ?",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in &rows {
            let event = row_to_event(row)?;
            let attempts = to_u32(row.try_get("attempts")?).saturating_add(1);
            let observed: Option<i64> = row.try_get("redeliver_version")?;
            let claimed = sqlx::query(
                "UPDATE change_log SET attempts = attempts + 1, available_at = ? \
                 WHERE seq = ? AND available_at <= ? AND delivered_at IS NULL AND dead_at IS NULL",
            )
            .bind(now.saturating_add(self.lease_ms))
            .bind(event.seq)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }
            deliveries.push(Delivery {
                event,
                attempt: attempts,
                observed_version: observed.and_then(|v| u64::try_from(v).ok()),
            });
        }
        tx.commit().await?;
        if !deliveries.is_empty() {
            debug!(target: "plantkeeper", event = "bus_poll", claimed = deliveries.len());
        }
        Ok(deliveries)
    }

    async fn ack(&self, seq: i64) -> SyncResult<()> {
        sqlx::query("UPDATE change_log SET delivered_at = ?, last_error = NULL WHERE seq = ?")
            .bind(now_ms())
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        seq: i64,
        error: &str,
        retry_at: i64,
        observed_version: Option<u64>,
    ) -> SyncResult<()> {
        sqlx::query(
            "UPDATE change_log SET available_at = ?, last_error = ?, \
             redeliver_version = COALESCE(?, redeliver_version) WHERE seq = ?",
        )
        .bind(retry_at)
        .bind(error)
        .bind(observed_version.map(|v| v as i64))
        .bind(seq)
        .execute(&self.pool)
        .await?;
        debug!(target: "plantkeeper", event = "bus_nack", seq, retry_at, error = %error);
        Ok(())
    }

    async fn dead_letter(&self, seq: i64, error: &str) -> SyncResult<()> {
        sqlx::query("UPDATE change_log SET dead_at = ?, last_error = ? WHERE seq = ?")
            .bind(now_ms())
            .bind(error)
            .bind(seq)
            .execute(&self.pool)
            .await?;
        warn!(target: "plantkeeper", event = "bus_dead_letter", seq, error = %error);
        Ok(())
    }
}
