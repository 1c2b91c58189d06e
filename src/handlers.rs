//! Reactions to entity-change events.
//!
//! Every handler is idempotent per `(entity id, post-write version)`: the bus
//! may hand the same event out more than once and the end state must not
//! depend on how often it did.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::bus::Delivery;
use crate::error::{SyncError, SyncResult};
use crate::model::{
    ActivityType, CareActivity, ChangeOp, DeletedPlant, EntityKind, Plant, PlantStatus, Record,
    DEFAULT_FERTILIZING_DAYS, DEFAULT_WATERING_DAYS,
};
use crate::notify::{DerivedFact, NotificationSink};
use crate::store::{find_entity, list_entities, put_entity, EntityStore, Expect, Query, StoreHandle};

pub const ON_PLANT_CREATED: &str = "on_plant_created";
pub const ON_CARE_ACTIVITY_CREATED: &str = "on_care_activity_created";
pub const ON_CARE_ACTIVITY_DELETED: &str = "on_care_activity_deleted";
pub const ON_PLANT_DELETED: &str = "on_plant_deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The handler wrote to the store.
    Wrote,
    /// The event was handled and the store already reflected it.
    Unchanged,
    /// No handler is registered for this event.
    Unhandled,
}

/// Name of the handler registered for `(kind, op)`, if any.
pub fn handler_for(kind: EntityKind, op: ChangeOp) -> Option<&'static str> {
    match (kind, op) {
        (EntityKind::Plant, ChangeOp::Create) => Some(ON_PLANT_CREATED),
        (EntityKind::Plant, ChangeOp::Delete) => Some(ON_PLANT_DELETED),
        (EntityKind::CareActivity, ChangeOp::Create) => Some(ON_CARE_ACTIVITY_CREATED),
        (EntityKind::CareActivity, ChangeOp::Delete) => Some(ON_CARE_ACTIVITY_DELETED),
        _ => None,
    }
}

/// Fill in schedule defaults and status. Returns false when nothing changed.
///
/// Values a care handler already recorded are kept: the plant and its first
/// activity live on different keys, so their handlers may run in any order.
pub fn normalize_new_plant(plant: &mut Plant, created_at: i64) -> bool {
    let before = plant.clone();
    plant.watering_frequency_days.get_or_insert(DEFAULT_WATERING_DAYS);
    plant
        .fertilizing_frequency_days
        .get_or_insert(DEFAULT_FERTILIZING_DAYS);
    plant.plant_status.get_or_insert(PlantStatus::Healthy);
    plant.last_watered.get_or_insert(created_at);
    plant.last_fertilized.get_or_insert(created_at);
    *plant != before
}

/// Fold one activity into the plant's care summary. Returns false when the
/// activity was already counted.
pub fn record_care(plant: &mut Plant, activity_id: &str, activity: &CareActivity) -> bool {
    if !plant.care.counted_activities.insert(activity_id.to_string()) {
        return false;
    }
    plant.care.total_care_actions = plant.care.total_care_actions.saturating_add(1);
    let newest = plant
        .care
        .last_care_date
        .map_or(true, |last| activity.performed_at >= last);
    if newest {
        plant.care.last_care_action = Some(activity.activity_type);
        plant.care.last_care_date = Some(activity.performed_at);
    }
    match activity.activity_type {
        ActivityType::Watering => {
            if plant.last_watered.map_or(true, |at| activity.performed_at > at) {
                plant.last_watered = Some(activity.performed_at);
            }
            plant.plant_status = Some(PlantStatus::Healthy);
        }
        ActivityType::Fertilizing => {
            if plant.last_fertilized.map_or(true, |at| activity.performed_at > at) {
                plant.last_fertilized = Some(activity.performed_at);
            }
        }
        _ => {}
    }
    true
}

/// Remove one activity from the care summary. `remaining` are the other
/// counted activities, used to restore the latest care entry.
pub fn forget_care(
    plant: &mut Plant,
    activity_id: &str,
    remaining: &[Record<CareActivity>],
) -> bool {
    if !plant.care.counted_activities.remove(activity_id) {
        return false;
    }
    plant.care.total_care_actions = plant.care.total_care_actions.saturating_sub(1);
    let latest = remaining
        .iter()
        .filter(|record| record.id != activity_id)
        .filter(|record| plant.care.counted_activities.contains(&record.id))
        .max_by_key(|record| record.body.performed_at);
    plant.care.last_care_action = latest.map(|record| record.body.activity_type);
    plant.care.last_care_date = latest.map(|record| record.body.performed_at);
    true
}

struct PlantChange {
    before: Plant,
    after: Plant,
}

#[derive(Clone)]
pub struct Handlers {
    store: StoreHandle,
    sink: Arc<dyn NotificationSink>,
    max_attempts: u32,
}

impl Handlers {
    pub fn new(store: StoreHandle, sink: Arc<dyn NotificationSink>, max_attempts: u32) -> Self {
        Self {
            store,
            sink,
            max_attempts: max_attempts.max(1),
        }
    }

    fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    pub async fn handle(&self, delivery: &Delivery) -> SyncResult<HandlerOutcome> {
        let event = &delivery.event;
        match handler_for(event.kind, event.op) {
            Some(ON_PLANT_CREATED) => self.on_plant_created(delivery).await,
            Some(ON_CARE_ACTIVITY_CREATED) => self.on_care_activity_created(delivery).await,
            Some(ON_CARE_ACTIVITY_DELETED) => self.on_care_activity_deleted(delivery).await,
            Some(ON_PLANT_DELETED) => self.on_plant_deleted(delivery).await,
            _ => Ok(HandlerOutcome::Unhandled),
        }
    }

    /// Assign schedule defaults to a new plant, writing against the version
    /// carried by the delivery.
    pub async fn on_plant_created(&self, delivery: &Delivery) -> SyncResult<HandlerOutcome> {
        let id = &delivery.event.entity_id;
        let Some(record) = find_entity::<Plant>(self.store(), id).await? else {
            debug!(target: "plantkeeper", event = "handler_parent_gone", handler = ON_PLANT_CREATED, id = %id);
            return Ok(HandlerOutcome::Unchanged);
        };
        let mut plant = record.body.clone();
        if !normalize_new_plant(&mut plant, record.created_at) {
            return Ok(HandlerOutcome::Unchanged);
        }

        let expected = delivery.expected_version();
        match put_entity(self.store(), id, &plant, Expect::Version(expected)).await {
            Ok(version) => {
                info!(target: "plantkeeper", event = "plant_normalized", id = %id, version);
                self.publish_plant_changes(id, &record.body, &plant);
                Ok(HandlerOutcome::Wrote)
            }
            Err(SyncError::VersionConflict {
                actual: Some(observed),
                ..
            }) => Err(SyncError::StaleWrite {
                kind: EntityKind::Plant,
                id: id.clone(),
                event_version: delivery.event.version,
                observed,
            }),
            // Deleted while we were working; the delete handler takes over.
            Err(SyncError::VersionConflict { actual: None, .. }) => Ok(HandlerOutcome::Unchanged),
            Err(err) => Err(err),
        }
    }

    /// Count a new activity on its parent plant. A missing parent is not an error.
    pub async fn on_care_activity_created(&self, delivery: &Delivery) -> SyncResult<HandlerOutcome> {
        let activity_id = delivery.event.entity_id.clone();
        let activity: CareActivity = serde_json::from_value(delivery.event.payload.clone())?;
        let change = self
            .modify_plant(ON_CARE_ACTIVITY_CREATED, &activity.plant_id, |plant| {
                record_care(plant, &activity_id, &activity)
            })
            .await?;
        let Some(change) = change else {
            return Ok(HandlerOutcome::Unchanged);
        };
        self.sink.publish(DerivedFact::CareRecorded {
            plant_id: activity.plant_id.clone(),
            activity_id,
            activity_type: activity.activity_type,
            total_care_actions: change.after.care.total_care_actions,
        });
        self.publish_plant_changes(&activity.plant_id, &change.before, &change.after);
        Ok(HandlerOutcome::Wrote)
    }

    pub async fn on_care_activity_deleted(&self, delivery: &Delivery) -> SyncResult<HandlerOutcome> {
        let activity_id = delivery.event.entity_id.clone();
        let activity: CareActivity = serde_json::from_value(delivery.event.payload.clone())?;
        let siblings = list_entities::<CareActivity>(
            self.store(),
            &Query::children_of(activity.plant_id.clone()),
        )
        .await?;
        let change = self
            .modify_plant(ON_CARE_ACTIVITY_DELETED, &activity.plant_id, |plant| {
                forget_care(plant, &activity_id, &siblings)
            })
            .await?;
        Ok(if change.is_some() {
            HandlerOutcome::Wrote
        } else {
            HandlerOutcome::Unchanged
        })
    }

    /// Archive a deleted plant. An archive that already exists counts as done.
    pub async fn on_plant_deleted(&self, delivery: &Delivery) -> SyncResult<HandlerOutcome> {
        let event = &delivery.event;
        let mut plant: Plant = serde_json::from_value(event.payload.clone())?;
        plant.active = false;
        let archive = DeletedPlant {
            plant,
            original_version: event.version.saturating_sub(1),
            deleted_at: event.created_at,
        };
        match put_entity(self.store(), &event.entity_id, &archive, Expect::Absent).await {
            Ok(_) => {
                info!(target: "plantkeeper", event = "plant_archived", id = %event.entity_id);
                self.sink.publish(DerivedFact::PlantArchived {
                    plant_id: event.entity_id.clone(),
                    original_version: archive.original_version,
                });
                Ok(HandlerOutcome::Wrote)
            }
            Err(SyncError::VersionConflict { .. }) => {
                debug!(target: "plantkeeper", event = "plant_archive_exists", id = %event.entity_id);
                Ok(HandlerOutcome::Unchanged)
            }
            Err(err) => Err(err),
        }
    }

    /// Optimistic read-modify-write on a plant, retried on version conflicts.
    /// `None` means the plant is gone or `mutate` reported no change.
    async fn modify_plant<F>(
        &self,
        handler: &'static str,
        plant_id: &str,
        mut mutate: F,
    ) -> SyncResult<Option<PlantChange>>
    where
        F: FnMut(&mut Plant) -> bool + Send,
    {
        for attempt in 1..=self.max_attempts {
            let Some(record) = find_entity::<Plant>(self.store(), plant_id).await? else {
                debug!(target: "plantkeeper", event = "handler_parent_gone", handler, id = %plant_id);
                return Ok(None);
            };
            let mut plant = record.body.clone();
            if !mutate(&mut plant) {
                return Ok(None);
            }
            match put_entity(self.store(), plant_id, &plant, Expect::Version(record.version)).await {
                Ok(_) => {
                    return Ok(Some(PlantChange {
                        before: record.body,
                        after: plant,
                    }))
                }
                Err(SyncError::VersionConflict { .. }) => {
                    debug!(target: "plantkeeper", event = "handler_retry", handler, id = %plant_id, attempt);
                }
                Err(err) => return Err(err),
            }
        }
        Err(SyncError::HandlerExhausted {
            handler,
            kind: EntityKind::Plant,
            id: plant_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn publish_plant_changes(&self, plant_id: &str, before: &Plant, after: &Plant) {
        let schedule_before = (before.watering_frequency_days, before.fertilizing_frequency_days);
        let schedule_after = (after.watering_frequency_days, after.fertilizing_frequency_days);
        if schedule_before != schedule_after {
            self.sink.publish(DerivedFact::ScheduleAssigned {
                plant_id: plant_id.to_string(),
                watering_days: after.watering_interval_days(),
                fertilizing_days: after
                    .fertilizing_frequency_days
                    .unwrap_or(DEFAULT_FERTILIZING_DAYS),
            });
        }
        if before.plant_status != after.plant_status {
            if let Some(status) = after.plant_status {
                self.sink.publish(DerivedFact::StatusChanged {
                    plant_id: plant_id.to_string(),
                    status,
                });
            }
        }
    }
}
