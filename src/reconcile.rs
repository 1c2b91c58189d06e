//! Replays queued client writes against the authoritative store.
//!
//! Updates are merged field by field: a field keeps the stored value when its
//! stored client clock is newer than the queued write's, otherwise the queued
//! value wins. This holds even when the versions match. Create and delete conflicts are
//! never decided automatically; the write is parked as failed and reported.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ConflictReason, SyncError, SyncResult};
use crate::model::{ChangeOp, EntityKind, RawRecord};
use crate::queue::{PendingQueue, PendingWrite, WriteStatus};
use crate::retry::with_deadline;
use crate::store::{merge_fields, EntityStore, Expect, Put, SqliteEntityStore, StoreHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualResolution {
    pub seq: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub reason: ConflictReason,
}

impl ManualResolution {
    pub fn to_error(&self) -> SyncError {
        SyncError::ManualResolutionRequired {
            seq: self.seq,
            kind: self.kind,
            id: self.entity_id.clone(),
            reason: self.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedWrite {
    pub seq: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub applied: u32,
    /// Applied after a field-level merge with a concurrent write.
    pub merged: u32,
    pub retried: u32,
    /// Writes that used up their retry budget or were structurally invalid.
    pub failed: Vec<RejectedWrite>,
    pub manual: Vec<ManualResolution>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.manual.is_empty()
    }
}

#[derive(Debug)]
enum Applied {
    /// The authoritative store holds `record` (a tombstone for deletes).
    Stored { record: RawRecord, merged: bool },
    /// Nothing left to write; the store already reflects the outcome.
    Settled,
}

enum Outcome {
    Applied { merged: bool },
    Retried,
    Failed(RejectedWrite),
    Manual(ManualResolution),
    Skipped,
}

fn payload_fields(payload: &Value) -> Vec<&str> {
    payload
        .as_object()
        .map(|object| object.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// True when `record` already carries every field of `write` under the
/// write's own client clock, as after a lost acknowledgement.
fn already_applied(record: &RawRecord, write: &PendingWrite) -> bool {
    let Some(fields) = write.payload.as_object() else {
        return false;
    };
    fields.iter().all(|(field, value)| {
        record.field_clocks.get(field) == Some(&write.client_ts)
            && record.body.get(field) == Some(value)
    })
}

#[derive(Clone)]
pub struct Reconciler {
    queue: PendingQueue,
    remote: StoreHandle,
    snapshot: SqliteEntityStore,
    deadline_ms: u64,
    merge_attempts: u32,
    batch_size: u32,
}

impl Reconciler {
    pub fn new(
        queue: PendingQueue,
        remote: StoreHandle,
        snapshot: SqliteEntityStore,
        config: &SyncConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            snapshot,
            deadline_ms: config.reconcile_deadline_ms,
            merge_attempts: config.reconcile_merge_attempts.max(1),
            batch_size: config.batch_size,
        }
    }

    fn remote(&self) -> &dyn EntityStore {
        self.remote.as_ref()
    }

    /// Push every ready write to the authoritative store. Keys progress
    /// independently; writes on one key go strictly in sequence order.
    pub async fn drain(&self, now: i64) -> SyncResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        loop {
            let ready = self.queue.peek_ready(now, self.batch_size).await?;
            if ready.is_empty() {
                break;
            }
            let outcomes = join_all(ready.into_iter().map(|write| self.process(write, now))).await;
            for outcome in outcomes {
                match outcome? {
                    Outcome::Applied { merged } => {
                        report.applied += 1;
                        if merged {
                            report.merged += 1;
                        }
                    }
                    Outcome::Retried => report.retried += 1,
                    Outcome::Failed(rejected) => report.failed.push(rejected),
                    Outcome::Manual(manual) => report.manual.push(manual),
                    Outcome::Skipped => {}
                }
            }
        }
        info!(
            target: "plantkeeper",
            event = "reconcile_drained",
            applied = report.applied,
            merged = report.merged,
            retried = report.retried,
            failed = report.failed.len(),
            manual = report.manual.len()
        );
        Ok(report)
    }

    async fn process(&self, write: PendingWrite, now: i64) -> SyncResult<Outcome> {
        if !self.queue.mark_applying(write.seq).await? {
            return Ok(Outcome::Skipped);
        }
        let result = with_deadline("reconcile", self.deadline_ms, self.apply(&write)).await;
        match result {
            Ok(applied) => {
                let merged = self.settle(&write, applied).await?;
                Ok(Outcome::Applied { merged })
            }
            Err(SyncError::ManualResolutionRequired { reason, .. }) => {
                let manual = ManualResolution {
                    seq: write.seq,
                    kind: write.kind,
                    entity_id: write.entity_id.clone(),
                    reason,
                };
                self.queue
                    .mark_failed(write.seq, &manual.to_error().to_string())
                    .await?;
                Ok(Outcome::Manual(manual))
            }
            Err(err) if err.is_transient() => {
                let message = err.to_string();
                match self.queue.fail(write.seq, &message, now).await? {
                    WriteStatus::Failed => Ok(Outcome::Failed(RejectedWrite {
                        seq: write.seq,
                        error: message,
                    })),
                    _ => Ok(Outcome::Retried),
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(target: "plantkeeper", event = "reconcile_rejected", seq = write.seq, error = %message);
                self.queue.mark_failed(write.seq, &message).await?;
                Ok(Outcome::Failed(RejectedWrite {
                    seq: write.seq,
                    error: message,
                }))
            }
        }
    }

    fn manual(write: &PendingWrite, reason: ConflictReason) -> SyncError {
        SyncError::ManualResolutionRequired {
            seq: write.seq,
            kind: write.kind,
            id: write.entity_id.clone(),
            reason,
        }
    }

    async fn apply(&self, write: &PendingWrite) -> SyncResult<Applied> {
        match write.op {
            ChangeOp::Create => self.apply_create(write).await,
            ChangeOp::Update => self.apply_update(write).await,
            ChangeOp::Delete => self.apply_delete(write).await,
        }
    }

    async fn apply_create(&self, write: &PendingWrite) -> SyncResult<Applied> {
        let put = Put::new(write.kind, &write.entity_id, write.payload.clone())
            .expect(Expect::Absent)
            .clocked(write.client_ts, payload_fields(&write.payload));
        match self.remote().put(put).await {
            Ok(_) => {
                let record = self.remote().get(write.kind, &write.entity_id).await?;
                Ok(Applied::Stored {
                    record,
                    merged: false,
                })
            }
            Err(SyncError::VersionConflict { .. }) => {
                match self.remote().get(write.kind, &write.entity_id).await {
                    Ok(record) if already_applied(&record, write) => {
                        debug!(target: "plantkeeper", event = "reconcile_create_replayed", seq = write.seq);
                        Ok(Applied::Stored {
                            record,
                            merged: false,
                        })
                    }
                    Ok(_) | Err(SyncError::NotFound { .. }) => {
                        Err(Self::manual(write, ConflictReason::AlreadyExists))
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_update(&self, write: &PendingWrite) -> SyncResult<Applied> {
        for attempt in 1..=self.merge_attempts {
            let current = match self.remote().get(write.kind, &write.entity_id).await {
                Ok(record) => record,
                Err(SyncError::NotFound { .. }) => {
                    return Err(Self::manual(write, ConflictReason::DeletedRemotely))
                }
                Err(err) => return Err(err),
            };
            let raced = write.expected_version != Some(current.version);
            let Some(patch) = write.payload.as_object() else {
                return Err(SyncError::validation("payload", "update payload must be an object"));
            };

            // Last writer wins per field, by client clock. A matching version
            // says nothing about clocks once earlier writes were rebased.
            let winners: serde_json::Map<String, Value> = patch
                .iter()
                .filter(|(field, _)| {
                    current
                        .field_clocks
                        .get(field.as_str())
                        .map_or(true, |stored| *stored <= write.client_ts)
                })
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            let merged = raced || winners.len() < patch.len();
            if winners.is_empty() {
                debug!(target: "plantkeeper", event = "reconcile_update_superseded", seq = write.seq);
                return Ok(Applied::Stored {
                    record: current,
                    merged: true,
                });
            }

            let mut body = current.body.clone();
            let winners = Value::Object(winners);
            merge_fields(&mut body, &winners)?;
            let put = Put::new(write.kind, &write.entity_id, body)
                .expect(Expect::Version(current.version))
                .clocked(write.client_ts, payload_fields(&winners));
            match self.remote().put(put).await {
                Ok(_) => {
                    let record = self.remote().get(write.kind, &write.entity_id).await?;
                    return Ok(Applied::Stored { record, merged });
                }
                Err(SyncError::VersionConflict { actual: None, .. }) => {
                    return Err(Self::manual(write, ConflictReason::DeletedRemotely))
                }
                Err(SyncError::VersionConflict { .. }) => {
                    debug!(target: "plantkeeper", event = "reconcile_merge_retry", seq = write.seq, attempt);
                }
                Err(err) => return Err(err),
            }
        }
        Err(SyncError::VersionConflict {
            kind: write.kind,
            id: write.entity_id.clone(),
            expected: write
                .expected_version
                .map_or(Expect::Any, Expect::Version),
            actual: None,
        })
    }

    /// Deletes go through unless another client edited the record after the
    /// user last saw it. Changes written by server-side handlers carry no
    /// client clocks and do not block the delete.
    async fn apply_delete(&self, write: &PendingWrite) -> SyncResult<Applied> {
        let current = match self.remote().get(write.kind, &write.entity_id).await {
            Ok(record) => record,
            Err(SyncError::NotFound { .. }) => return Ok(Applied::Settled),
            Err(err) => return Err(err),
        };
        if write.expected_version != Some(current.version) {
            let seen = self
                .snapshot
                .get_any(write.kind, &write.entity_id)
                .await?
                .map(|record| record.field_clocks);
            if seen.as_ref() != Some(&current.field_clocks) {
                return Err(Self::manual(write, ConflictReason::ChangedBeforeDelete));
            }
        }
        match self
            .remote()
            .delete(write.kind, &write.entity_id, Expect::Version(current.version))
            .await
        {
            Ok(record) => Ok(Applied::Stored {
                record,
                merged: false,
            }),
            Err(SyncError::NotFound { .. }) => Ok(Applied::Settled),
            Err(SyncError::VersionConflict { .. }) => {
                Err(Self::manual(write, ConflictReason::ChangedBeforeDelete))
            }
            Err(err) => Err(err),
        }
    }

    /// Ack the write, rebase later writes on the key, and bring the local
    /// snapshot up to the confirmed state.
    async fn settle(&self, write: &PendingWrite, applied: Applied) -> SyncResult<bool> {
        self.queue.ack(write.seq).await?;
        let (record, merged) = match applied {
            Applied::Stored { record, merged } => (record, merged),
            Applied::Settled => {
                debug!(target: "plantkeeper", event = "reconcile_settled", seq = write.seq);
                return Ok(false);
            }
        };
        let from = write.expected_version.unwrap_or(0);
        self.queue
            .rebase(write.kind, &write.entity_id, from, record.version)
            .await?;
        let later = self
            .queue
            .pending_after(write.kind, &write.entity_id, write.seq)
            .await?;
        if later == 0 {
            self.snapshot.adopt(write.kind, &record).await?;
        } else {
            self.snapshot
                .confirm_version(write.kind, &write.entity_id, record.version, &record.field_clocks)
                .await?;
        }
        info!(
            target: "plantkeeper",
            event = "reconcile_applied",
            seq = write.seq,
            kind = %write.kind,
            id = %write.entity_id,
            op = %write.op,
            version = record.version,
            merged
        );
        Ok(merged)
    }
}
