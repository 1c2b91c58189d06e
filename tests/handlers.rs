use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use plantkeeper_lib::bus::{EventBus, OutboxBus};
use plantkeeper_lib::handlers::{HandlerOutcome, Handlers, ON_CARE_ACTIVITY_CREATED};
use plantkeeper_lib::model::{
    ActivityType, DeletedPlant, Plant, PlantStatus, RawRecord, DEFAULT_FERTILIZING_DAYS,
    DEFAULT_WATERING_DAYS,
};
use plantkeeper_lib::notify::CollectingSink;
use plantkeeper_lib::store::{
    get_entity, list_entities, EntityStore, Expect, Put, Query, SqliteEntityStore,
};
use plantkeeper_lib::time::now_ms;
use plantkeeper_lib::{EntityKind, SyncError, SyncResult};

#[path = "util.rs"]
mod util;

use util::{activity_payload, plant_payload, poll_all, temp_pool};

struct Fixture {
    store: SqliteEntityStore,
    bus: OutboxBus,
    handlers: Handlers,
    sink: Arc<CollectingSink>,
}

async fn fixture() -> Fixture {
    let pool = temp_pool().await;
    let store = SqliteEntityStore::authority(pool.clone());
    let sink = Arc::new(CollectingSink::new());
    let handlers = Handlers::new(Arc::new(store.clone()), sink.clone(), 3);
    Fixture {
        store,
        bus: OutboxBus::new(pool),
        handlers,
        sink,
    }
}

#[tokio::test]
async fn plant_created_twice_matches_plant_created_once() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")).expect(Expect::Absent))
        .await?;
    let deliveries = poll_all(&fx.bus).await;
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];

    assert_eq!(fx.handlers.on_plant_created(delivery).await?, HandlerOutcome::Wrote);
    let once = get_entity::<Plant>(&fx.store, "p1").await?;
    assert_eq!(fx.handlers.on_plant_created(delivery).await?, HandlerOutcome::Unchanged);
    let twice = get_entity::<Plant>(&fx.store, "p1").await?;
    assert_eq!(once, twice);

    let plant = twice.body;
    assert_eq!(plant.watering_frequency_days, Some(DEFAULT_WATERING_DAYS));
    assert_eq!(plant.fertilizing_frequency_days, Some(DEFAULT_FERTILIZING_DAYS));
    assert_eq!(plant.care.total_care_actions, 0);
    assert_eq!(plant.plant_status, Some(PlantStatus::Healthy));
    assert_eq!(plant.last_watered, Some(twice.created_at));
    assert_eq!(plant.last_fertilized, Some(twice.created_at));
    assert_eq!(fx.sink.count("schedule_assigned"), 1);
    Ok(())
}

#[tokio::test]
async fn plant_created_keeps_explicit_schedule() -> Result<()> {
    let fx = fixture().await;
    let mut payload = plant_payload("u1", "Cactus");
    payload["watering_frequency_days"] = json!(21);
    payload["last_watered"] = json!(1_000);
    fx.store.put(Put::new(EntityKind::Plant, "p1", payload)).await?;
    let deliveries = poll_all(&fx.bus).await;
    fx.handlers.on_plant_created(&deliveries[0]).await?;

    let plant = get_entity::<Plant>(&fx.store, "p1").await?.body;
    assert_eq!(plant.watering_frequency_days, Some(21));
    assert_eq!(plant.last_watered, Some(1_000));
    assert_eq!(plant.fertilizing_frequency_days, Some(DEFAULT_FERTILIZING_DAYS));
    Ok(())
}

#[tokio::test]
async fn plant_created_reports_stale_write_and_succeeds_on_redelivery() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")))
        .await?;
    let deliveries = poll_all(&fx.bus).await;
    let first = deliveries[0].clone();

    // The user renames the plant before the handler runs.
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Frond")).expect(Expect::Version(1)))
        .await?;

    let err = fx
        .handlers
        .on_plant_created(&first)
        .await
        .expect_err("handler must lose the race");
    let observed = match err {
        SyncError::StaleWrite {
            event_version,
            observed,
            ..
        } => {
            assert_eq!(event_version, 1);
            observed
        }
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(observed, 2);

    fx.bus
        .nack(first.event.seq, "stale", now_ms(), Some(observed))
        .await?;
    let redelivered = poll_all(&fx.bus).await;
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].event.seq, first.event.seq);
    assert_eq!(redelivered[0].attempt, 2);
    assert_eq!(redelivered[0].expected_version(), 2);

    assert_eq!(fx.handlers.on_plant_created(&redelivered[0]).await?, HandlerOutcome::Wrote);
    let record = get_entity::<Plant>(&fx.store, "p1").await?;
    assert_eq!(record.version, 3);
    assert_eq!(record.body.nickname, "Frond");
    assert_eq!(record.body.watering_frequency_days, Some(DEFAULT_WATERING_DAYS));
    Ok(())
}

#[tokio::test]
async fn care_activity_increments_parent_once() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")))
        .await?;
    let performed_at = now_ms();
    fx.store
        .put(Put::new(
            EntityKind::CareActivity,
            "a1",
            activity_payload("p1", "u1", "watering", performed_at),
        ))
        .await?;

    let deliveries = poll_all(&fx.bus).await;
    let activity_event = deliveries
        .iter()
        .find(|d| d.event.kind == EntityKind::CareActivity)
        .expect("activity delivery");
    assert_eq!(
        fx.handlers.on_care_activity_created(activity_event).await?,
        HandlerOutcome::Wrote
    );
    assert_eq!(
        fx.handlers.on_care_activity_created(activity_event).await?,
        HandlerOutcome::Unchanged
    );

    let plant = get_entity::<Plant>(&fx.store, "p1").await?.body;
    assert_eq!(plant.care.total_care_actions, 1);
    assert_eq!(plant.care.last_care_action, Some(ActivityType::Watering));
    assert_eq!(plant.care.last_care_date, Some(performed_at));
    assert_eq!(plant.last_watered, Some(performed_at));
    assert_eq!(fx.sink.count("care_recorded"), 1);
    Ok(())
}

#[tokio::test]
async fn care_activity_for_missing_parent_is_a_no_op() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(
            EntityKind::CareActivity,
            "a1",
            activity_payload("gone", "u1", "pruning", 1_000),
        ))
        .await?;
    let deliveries = poll_all(&fx.bus).await;
    assert_eq!(
        fx.handlers.handle(&deliveries[0]).await?,
        HandlerOutcome::Unchanged
    );
    assert!(fx.sink.facts().is_empty());
    Ok(())
}

#[tokio::test]
async fn plant_deleted_twice_yields_one_archive() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")))
        .await?;
    let created = poll_all(&fx.bus).await;
    fx.bus.ack(created[0].event.seq).await?;
    fx.store.delete(EntityKind::Plant, "p1", Expect::Any).await?;

    let deliveries = poll_all(&fx.bus).await;
    let delete = &deliveries[0];
    assert_eq!(fx.handlers.handle(delete).await?, HandlerOutcome::Wrote);
    assert_eq!(fx.handlers.handle(delete).await?, HandlerOutcome::Unchanged);

    let archives = list_entities::<DeletedPlant>(&fx.store, &Query::owned_by("u1")).await?;
    assert_eq!(archives.len(), 1);
    let archive = &archives[0];
    assert_eq!(archive.id, "p1");
    assert_eq!(archive.body.plant.nickname, "Fern");
    assert!(!archive.body.plant.active);
    assert_eq!(archive.body.original_version, 1);
    assert_eq!(fx.sink.count("plant_archived"), 1);
    Ok(())
}

#[tokio::test]
async fn deleting_a_counted_activity_decrements_the_total() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")))
        .await?;
    for (id, at) in [("a1", 1_000), ("a2", 2_000)] {
        fx.store
            .put(Put::new(
                EntityKind::CareActivity,
                id,
                activity_payload("p1", "u1", "fertilizing", at),
            ))
            .await?;
    }
    for delivery in poll_all(&fx.bus).await {
        fx.handlers.handle(&delivery).await?;
        fx.bus.ack(delivery.event.seq).await?;
    }
    fx.store.delete(EntityKind::CareActivity, "a2", Expect::Any).await?;
    for delivery in poll_all(&fx.bus).await {
        fx.handlers.handle(&delivery).await?;
    }

    let plant = get_entity::<Plant>(&fx.store, "p1").await?.body;
    assert_eq!(plant.care.total_care_actions, 1);
    assert_eq!(plant.care.last_care_date, Some(1_000));
    assert!(plant.care.counted_activities.contains("a1"));
    assert!(!plant.care.counted_activities.contains("a2"));
    Ok(())
}

/// Reads pass through; every conditional plant write loses a race.
struct ContendedStore {
    inner: SqliteEntityStore,
}

#[async_trait]
impl EntityStore for ContendedStore {
    async fn get(&self, kind: EntityKind, id: &str) -> SyncResult<RawRecord> {
        self.inner.get(kind, id).await
    }

    async fn put(&self, put: Put) -> SyncResult<u64> {
        if put.kind == EntityKind::Plant {
            return Err(SyncError::VersionConflict {
                kind: put.kind,
                id: put.id,
                expected: put.expect,
                actual: Some(99),
            });
        }
        self.inner.put(put).await
    }

    async fn delete(&self, kind: EntityKind, id: &str, expect: Expect) -> SyncResult<RawRecord> {
        self.inner.delete(kind, id, expect).await
    }

    async fn query(
        &self,
        kind: EntityKind,
        query: &plantkeeper_lib::store::Query,
    ) -> SyncResult<Vec<RawRecord>> {
        self.inner.query(kind, query).await
    }
}

#[tokio::test]
async fn care_handler_gives_up_after_bounded_retries() -> Result<()> {
    let fx = fixture().await;
    fx.store
        .put(Put::new(EntityKind::Plant, "p1", plant_payload("u1", "Fern")))
        .await?;
    fx.store
        .put(Put::new(
            EntityKind::CareActivity,
            "a1",
            activity_payload("p1", "u1", "watering", 1_000),
        ))
        .await?;
    let contended = Handlers::new(
        Arc::new(ContendedStore {
            inner: fx.store.clone(),
        }),
        fx.sink.clone(),
        4,
    );
    let deliveries = poll_all(&fx.bus).await;
    let activity = deliveries
        .iter()
        .find(|d| d.event.kind == EntityKind::CareActivity)
        .expect("activity delivery");

    let err = contended
        .on_care_activity_created(activity)
        .await
        .expect_err("budget exhausted");
    match err {
        SyncError::HandlerExhausted {
            handler, attempts, id, ..
        } => {
            assert_eq!(handler, ON_CARE_ACTIVITY_CREATED);
            assert_eq!(attempts, 4);
            assert_eq!(id, "p1");
        }
        other => panic!("unexpected error: {other}"),
    }
    let plant = get_entity::<Plant>(&fx.store, "p1").await?.body;
    assert_eq!(plant.care.total_care_actions, 0);
    Ok(())
}
