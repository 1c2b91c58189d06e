//! Surface the UI layer calls into.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AppResult, SyncError};
use crate::model::{
    canonical_payload, validate_payload, validate_update, ChangeOp, EntityKind, RawRecord, UserId,
};
use crate::queue::{NewWrite, PendingQueue};
use crate::stats::{self, Statistics};
use crate::store::{EntityStore, Query, SqliteEntityStore};
use crate::time::now_ms;

/// What the UI shows right after a local mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TentativeResult {
    /// Queue position of the write awaiting confirmation.
    pub seq: i64,
    /// The record as the local snapshot now holds it. Version 0 marks a
    /// create the server has not confirmed.
    pub record: RawRecord,
}

#[derive(Clone)]
pub struct LocalClient {
    queue: PendingQueue,
    snapshot: SqliteEntityStore,
}

impl LocalClient {
    pub fn new(queue: PendingQueue, snapshot: SqliteEntityStore) -> Self {
        Self { queue, snapshot }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn snapshot(&self) -> &SqliteEntityStore {
        &self.snapshot
    }

    /// Validate a mutation, reflect it in the local snapshot and queue it for
    /// the server. Field names are stored in snake_case whichever spelling the
    /// caller used. Invalid payloads leave both untouched.
    pub async fn apply_local_mutation(
        &self,
        kind: EntityKind,
        id: &str,
        op: ChangeOp,
        payload: Value,
    ) -> AppResult<TentativeResult> {
        let payload = canonical_payload(kind, op, payload)?;
        validate_payload(kind, op, &payload)?;
        if id.trim().is_empty() {
            return Err(SyncError::validation("id", "entity id must not be empty").into());
        }
        let expected_version = match op {
            ChangeOp::Create => None,
            ChangeOp::Update => {
                let current = self.snapshot.get(kind, id).await?;
                validate_update(kind, &current.body, &payload)?;
                Some(current.version)
            }
            ChangeOp::Delete => Some(self.snapshot.get(kind, id).await?.version),
        };

        let record = self
            .snapshot
            .apply_tentative(kind, id, op, &payload)
            .await?;
        let seq = self
            .queue
            .enqueue(NewWrite {
                kind,
                entity_id: id.to_string(),
                op,
                payload,
                expected_version,
                client_ts: now_ms(),
            })
            .await?;
        debug!(target: "plantkeeper", event = "local_mutation", seq, kind = %kind, id = %id, op = %op);
        Ok(TentativeResult { seq, record })
    }

    pub async fn get_statistics(&self, user: &UserId) -> AppResult<Statistics> {
        self.get_statistics_at(user, now_ms()).await
    }

    pub async fn get_statistics_at(&self, user: &UserId, now: i64) -> AppResult<Statistics> {
        Ok(stats::get_statistics(&self.snapshot, user, now).await?)
    }

    /// Copy the user's plants from the authoritative store into the snapshot,
    /// skipping any plant with queued writes. Returns how many were copied.
    pub async fn refresh_plants(&self, remote: &dyn EntityStore, user: &UserId) -> AppResult<u32> {
        let records = remote
            .query(EntityKind::Plant, &Query::owned_by(user.as_str()))
            .await?;
        let mut adopted = 0;
        for record in records {
            if self
                .queue
                .pending_after(EntityKind::Plant, &record.id, 0)
                .await?
                > 0
            {
                continue;
            }
            self.snapshot.adopt(EntityKind::Plant, &record).await?;
            adopted += 1;
        }
        info!(target: "plantkeeper", event = "snapshot_refreshed", user = %user, adopted);
        Ok(adopted)
    }
}
