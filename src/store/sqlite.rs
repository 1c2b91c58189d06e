use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use super::{merge_fields, EntityStore, Expect, FieldClocks, Put, Query};
use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeOp, EntityKind, RawRecord};
use crate::time::now_ms;

const SELECT_COLUMNS: &str =
    "SELECT id, version, body, field_clocks, created_at, updated_at, deleted_at FROM entities";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Authoritative store: every write appends to `change_log`.
    Authority,
    /// Client-side snapshot: no change events, versions mirror the server.
    Snapshot,
}

/// [`EntityStore`] over the `entities` table.
#[derive(Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
    mode: Mode,
}

fn conflict(kind: EntityKind, id: &str, expected: Expect, actual: Option<u64>) -> SyncError {
    SyncError::VersionConflict {
        kind,
        id: id.to_string(),
        expected,
        actual,
    }
}

/// A deleted plant is inactive, so tombstones never read as live plants.
fn retire_body(kind: EntityKind, body: &mut Value) {
    if kind == EntityKind::Plant {
        if let Some(object) = body.as_object_mut() {
            object.insert("active".to_string(), Value::Bool(false));
        }
    }
}

fn as_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> SyncResult<RawRecord> {
    let body: String = row.try_get("body")?;
    let clocks: String = row.try_get("field_clocks")?;
    Ok(RawRecord {
        id: row.try_get("id")?,
        version: as_version(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        field_clocks: serde_json::from_str(&clocks)?,
        body: serde_json::from_str(&body)?,
    })
}

/// Load a row including tombstones.
async fn fetch_any(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    id: &str,
) -> SyncResult<Option<RawRecord>> {
    let sql = format!("{SELECT_COLUMNS} WHERE kind = ? AND id = ?");
    let row = sqlx::query(&sql)
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_record).transpose()
}

fn merge_clocks(stored: &FieldClocks, incoming: &FieldClocks) -> FieldClocks {
    let mut merged = stored.clone();
    for (field, ts) in incoming {
        let slot = merged.entry(field.clone()).or_insert(*ts);
        if *ts > *slot {
            *slot = *ts;
        }
    }
    merged
}

impl SqliteEntityStore {
    pub fn authority(pool: SqlitePool) -> Self {
        Self {
            pool,
            mode: Mode::Authority,
        }
    }

    pub fn snapshot(pool: SqlitePool) -> Self {
        Self {
            pool,
            mode: Mode::Snapshot,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        id: &str,
        op: ChangeOp,
        version: u64,
        payload: &str,
        now: i64,
    ) -> SyncResult<()> {
        if self.mode != Mode::Authority {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO change_log (kind, entity_id, op, version, payload, created_at, available_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(op.as_str())
        .bind(version as i64)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Overwrite the snapshot row with a record confirmed by the server.
    pub async fn adopt(&self, kind: EntityKind, record: &RawRecord) -> SyncResult<()> {
        let (owner, parent) = kind.index_fields(&record.body);
        sqlx::query(
            "INSERT INTO entities (kind, id, version, owner_id, parent_id, body, field_clocks, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(kind, id) DO UPDATE SET \
               version = excluded.version, owner_id = excluded.owner_id, parent_id = excluded.parent_id, \
               body = excluded.body, field_clocks = excluded.field_clocks, \
               updated_at = excluded.updated_at, deleted_at = excluded.deleted_at",
        )
        .bind(kind.as_str())
        .bind(&record.id)
        .bind(record.version as i64)
        .bind(owner)
        .bind(parent)
        .bind(serde_json::to_string(&record.body)?)
        .bind(serde_json::to_string(&record.field_clocks)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.deleted_at)
        .execute(&self.pool)
        .await?;
        debug!(target: "plantkeeper", event = "snapshot_adopt", kind = %kind, id = %record.id, version = record.version);
        Ok(())
    }

    /// Record the server version and field clocks without touching a body
    /// that still carries tentative edits.
    pub async fn confirm_version(
        &self,
        kind: EntityKind,
        id: &str,
        version: u64,
        clocks: &FieldClocks,
    ) -> SyncResult<()> {
        sqlx::query("UPDATE entities SET version = ?, field_clocks = ? WHERE kind = ? AND id = ?")
            .bind(version as i64)
            .bind(serde_json::to_string(clocks)?)
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Like `get`, but tombstones are returned too.
    pub async fn get_any(&self, kind: EntityKind, id: &str) -> SyncResult<Option<RawRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE kind = ? AND id = ?");
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Apply a client mutation to the snapshot without bumping its version.
    pub async fn apply_tentative(
        &self,
        kind: EntityKind,
        id: &str,
        op: ChangeOp,
        payload: &Value,
    ) -> SyncResult<RawRecord> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let existing = fetch_any(&mut tx, kind, id).await?;
        let record = match (op, existing) {
            (ChangeOp::Create, Some(row)) => {
                return Err(conflict(kind, id, Expect::Absent, Some(row.version)))
            }
            (ChangeOp::Create, None) => {
                let (owner, parent) = kind.index_fields(payload);
                sqlx::query(
                    "INSERT INTO entities (kind, id, version, owner_id, parent_id, body, created_at, updated_at) \
                     VALUES (?, ?, 0, ?, ?, ?, ?, ?)",
                )
                .bind(kind.as_str())
                .bind(id)
                .bind(owner)
                .bind(parent)
                .bind(serde_json::to_string(payload)?)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                RawRecord {
                    id: id.to_string(),
                    version: 0,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                    field_clocks: FieldClocks::new(),
                    body: payload.clone(),
                }
            }
            (_, None) => return Err(SyncError::not_found(kind, id)),
            (_, Some(row)) if row.deleted_at.is_some() => {
                return Err(SyncError::not_found(kind, id))
            }
            (ChangeOp::Update, Some(mut row)) => {
                merge_fields(&mut row.body, payload)?;
                let (owner, parent) = kind.index_fields(&row.body);
                sqlx::query(
                    "UPDATE entities SET body = ?, owner_id = ?, parent_id = ?, updated_at = ? WHERE kind = ? AND id = ?",
                )
                .bind(serde_json::to_string(&row.body)?)
                .bind(owner)
                .bind(parent)
                .bind(now)
                .bind(kind.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                row.updated_at = now;
                row
            }
            (ChangeOp::Delete, Some(mut row)) => {
                retire_body(kind, &mut row.body);
                sqlx::query(
                    "UPDATE entities SET body = ?, deleted_at = ?, updated_at = ? WHERE kind = ? AND id = ?",
                )
                .bind(serde_json::to_string(&row.body)?)
                .bind(now)
                .bind(now)
                .bind(kind.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                row.deleted_at = Some(now);
                row.updated_at = now;
                row
            }
        };
        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn get(&self, kind: EntityKind, id: &str) -> SyncResult<RawRecord> {
        let sql = format!("{SELECT_COLUMNS} WHERE kind = ? AND id = ? AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_record(&row),
            None => Err(SyncError::not_found(kind, id)),
        }
    }

    async fn put(&self, put: Put) -> SyncResult<u64> {
        let Put {
            kind,
            id,
            body,
            expect,
            clocks,
        } = put;
        let now = now_ms();
        let (owner, parent) = kind.index_fields(&body);
        let body_text = serde_json::to_string(&body)?;

        let mut tx = self.pool.begin().await?;
        let existing = fetch_any(&mut tx, kind, &id).await?;
        let (version, op) = match (existing, expect) {
            (None, Expect::Version(_)) => return Err(conflict(kind, &id, expect, None)),
            (None, _) => {
                sqlx::query(
                    "INSERT INTO entities (kind, id, version, owner_id, parent_id, body, field_clocks, created_at, updated_at) \
                     VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?)",
                )
                .bind(kind.as_str())
                .bind(&id)
                .bind(owner)
                .bind(parent)
                .bind(&body_text)
                .bind(serde_json::to_string(&clocks)?)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (1, ChangeOp::Create)
            }
            (Some(row), Expect::Absent) => {
                return Err(conflict(kind, &id, expect, Some(row.version)))
            }
            (Some(row), _) if row.deleted_at.is_some() => {
                return Err(conflict(kind, &id, expect, None))
            }
            (Some(row), Expect::Version(v)) if row.version != v => {
                return Err(conflict(kind, &id, expect, Some(row.version)))
            }
            (Some(row), _) => {
                let merged = merge_clocks(&row.field_clocks, &clocks);
                let res = sqlx::query(
                    "UPDATE entities SET version = version + 1, owner_id = ?, parent_id = ?, body = ?, \
                     field_clocks = ?, updated_at = ? \
                     WHERE kind = ? AND id = ? AND version = ? AND deleted_at IS NULL",
                )
                .bind(owner)
                .bind(parent)
                .bind(&body_text)
                .bind(serde_json::to_string(&merged)?)
                .bind(now)
                .bind(kind.as_str())
                .bind(&id)
                .bind(row.version as i64)
                .execute(&mut *tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(conflict(kind, &id, expect, None));
                }
                (row.version + 1, ChangeOp::Update)
            }
        };
        self.emit(&mut tx, kind, &id, op, version, &body_text, now)
            .await?;
        tx.commit().await?;
        debug!(
            target: "plantkeeper",
            event = "entity_put",
            kind = %kind,
            id = %id,
            op = %op,
            version
        );
        Ok(version)
    }

    async fn delete(&self, kind: EntityKind, id: &str, expect: Expect) -> SyncResult<RawRecord> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let row = match fetch_any(&mut tx, kind, id).await? {
            Some(row) if row.deleted_at.is_none() => row,
            _ => return Err(SyncError::not_found(kind, id)),
        };
        match expect {
            Expect::Absent => return Err(conflict(kind, id, expect, Some(row.version))),
            Expect::Version(v) if v != row.version => {
                return Err(conflict(kind, id, expect, Some(row.version)))
            }
            _ => {}
        }
        let mut body = row.body.clone();
        retire_body(kind, &mut body);
        let res = sqlx::query(
            "UPDATE entities SET version = version + 1, body = ?, deleted_at = ?, updated_at = ? \
             WHERE kind = ? AND id = ? AND version = ? AND deleted_at IS NULL",
        )
        .bind(serde_json::to_string(&body)?)
        .bind(now)
        .bind(now)
        .bind(kind.as_str())
        .bind(id)
        .bind(row.version as i64)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(conflict(kind, id, expect, None));
        }
        let deleted = RawRecord {
            version: row.version + 1,
            updated_at: now,
            deleted_at: Some(now),
            body,
            ..row
        };
        let payload = serde_json::to_string(&deleted.body)?;
        self.emit(&mut tx, kind, id, ChangeOp::Delete, deleted.version, &payload, now)
            .await?;
        tx.commit().await?;
        debug!(
            target: "plantkeeper",
            event = "entity_delete",
            kind = %kind,
            id = %id,
            version = deleted.version
        );
        Ok(deleted)
    }

    async fn query(&self, kind: EntityKind, query: &Query) -> SyncResult<Vec<RawRecord>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE kind = ? AND deleted_at IS NULL");
        if query.owner_id.is_some() {
            sql.push_str(" AND owner_id = ?");
        }
        if query.parent_id.is_some() {
            sql.push_str(" AND parent_id = ?");
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(query.order.sql());
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(kind.as_str());
        if let Some(owner) = &query.owner_id {
            q = q.bind(owner);
        }
        if let Some(parent) = &query.parent_id {
            q = q.bind(parent);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }
}
