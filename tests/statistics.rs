use anyhow::Result;
use proptest::prelude::*;
use serde_json::json;

use plantkeeper_lib::model::Plant;
use plantkeeper_lib::stats::{compute_statistics, get_statistics, needs_watering};
use plantkeeper_lib::store::{EntityStore, Expect, Put};
use plantkeeper_lib::time::{now_ms, MS_PER_DAY};
use plantkeeper_lib::{ChangeOp, EntityKind, UserId};

#[path = "util.rs"]
mod util;

use util::{days_ago, harness, plant_payload};

const NOW: i64 = 1_760_000_000_000;

fn plant_strategy() -> impl Strategy<Value = Plant> {
    (
        proptest::option::of(0i64..120),
        proptest::option::of(1u32..60),
        any::<bool>(),
    )
        .prop_map(|(watered, frequency, active)| {
            let mut plant = Plant::new(&UserId::new("u1"), "Fern");
            plant.last_watered = watered.map(|days| NOW - days * MS_PER_DAY);
            plant.watering_frequency_days = frequency;
            plant.active = active;
            plant
        })
}

proptest! {
    #[test]
    fn never_watered_always_needs_water(frequency in proptest::option::of(1u32..365)) {
        let mut plant = Plant::new(&UserId::new("u1"), "Fern");
        plant.watering_frequency_days = frequency;
        prop_assert!(needs_watering(&plant, NOW));
    }

    #[test]
    fn counts_partition_the_total(plants in proptest::collection::vec(plant_strategy(), 0..40)) {
        let stats = compute_statistics(&plants, NOW);
        prop_assert_eq!(stats.total_plants as usize, plants.len());
        prop_assert_eq!(stats.healthy + stats.needs_water, stats.total_plants);
    }

    #[test]
    fn watering_resets_the_clock(frequency in 1u32..60) {
        let mut plant = Plant::new(&UserId::new("u1"), "Fern");
        plant.watering_frequency_days = Some(frequency);
        plant.last_watered = Some(NOW);
        prop_assert!(!needs_watering(&plant, NOW));
        prop_assert!(needs_watering(&plant, NOW + i64::from(frequency) * MS_PER_DAY));
    }
}

#[tokio::test]
async fn statistics_cover_only_the_users_active_plants() -> Result<()> {
    let h = harness().await;
    let store = &h.state.authority;
    let seed = [
        ("p1", "u1", json!({ "last_watered": days_ago(10), "watering_frequency_days": 7 })),
        ("p2", "u1", json!({ "last_watered": days_ago(3), "watering_frequency_days": 7 })),
        ("p3", "u1", json!({})),
        ("p4", "u1", json!({ "last_watered": days_ago(30), "active": false })),
        ("p5", "u2", json!({ "last_watered": days_ago(30) })),
    ];
    for (id, owner, extra) in seed {
        let mut body = plant_payload(owner, id);
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        store
            .put(Put::new(EntityKind::Plant, id, body).expect(Expect::Absent))
            .await?;
    }
    store.delete(EntityKind::Plant, "p2", Expect::Any).await?;
    store
        .put(Put::new(EntityKind::Plant, "p6", plant_payload("u1", "Ivy")).expect(Expect::Absent))
        .await?;
    store
        .put(
            Put::new(
                EntityKind::Plant,
                "p6",
                json!({ "owner_id": "u1", "nickname": "Ivy", "last_watered": now_ms() }),
            )
            .expect(Expect::Version(1)),
        )
        .await?;

    let stats = get_statistics(store, &UserId::new("u1"), now_ms()).await?;
    assert_eq!(stats.total_plants, 3);
    assert_eq!(stats.needs_water, 2);
    assert_eq!(stats.healthy, 1);

    let other = get_statistics(store, &UserId::new("u2"), now_ms()).await?;
    assert_eq!(other.total_plants, 1);
    assert_eq!(other.needs_water, 1);
    Ok(())
}

#[tokio::test]
async fn client_statistics_follow_the_local_snapshot() -> Result<()> {
    let h = harness().await;
    let client = &h.state.client;
    let user = UserId::new("u1");
    client
        .apply_local_mutation(EntityKind::Plant, "p1", ChangeOp::Create, plant_payload("u1", "Fern"))
        .await?;
    let stats = client.get_statistics(&user).await?;
    assert_eq!(stats.total_plants, 1);
    assert_eq!(stats.needs_water, 1, "never watered");

    // After sync the handlers stamp the schedule; refreshing picks it up.
    h.state.sync().await?;
    assert_eq!(client.refresh_plants(&h.state.authority, &user).await?, 1);
    let stats = client.get_statistics(&user).await?;
    assert_eq!(stats.needs_water, 0);
    assert_eq!(stats.healthy, 1);

    let later = now_ms() + 30 * MS_PER_DAY;
    assert_eq!(client.get_statistics_at(&user, later).await?.needs_water, 1);
    Ok(())
}

#[tokio::test]
async fn refresh_skips_plants_with_queued_writes() -> Result<()> {
    let h = harness().await;
    let client = &h.state.client;
    let user = UserId::new("u1");
    client
        .apply_local_mutation(EntityKind::Plant, "p1", ChangeOp::Create, plant_payload("u1", "Fern"))
        .await?;
    h.state.sync().await?;
    client
        .apply_local_mutation(EntityKind::Plant, "p1", ChangeOp::Update, json!({ "nickname": "Mine" }))
        .await?;

    assert_eq!(client.refresh_plants(&h.state.authority, &user).await?, 0);
    let local = client.snapshot().get(EntityKind::Plant, "p1").await?;
    assert_eq!(local.body["nickname"], "Mine");
    Ok(())
}

#[tokio::test]
async fn camel_case_plant_is_counted_for_its_owner() -> Result<()> {
    let h = harness().await;
    let client = &h.state.client;
    let user = UserId::new("u1");
    let tentative = client
        .apply_local_mutation(
            EntityKind::Plant,
            "p1",
            ChangeOp::Create,
            json!({ "userId": "u1", "nickname": "Fern", "wateringFrequency": 3 }),
        )
        .await?;
    assert_eq!(tentative.record.body["owner_id"], "u1");
    assert!(tentative.record.body.get("userId").is_none());
    assert_eq!(client.get_statistics(&user).await?.total_plants, 1);

    // The same field under two spellings is ambiguous.
    let err = client
        .apply_local_mutation(
            EntityKind::Plant,
            "p2",
            ChangeOp::Create,
            json!({ "owner_id": "u1", "ownerId": "u2", "nickname": "Ivy" }),
        )
        .await
        .expect_err("duplicate spelling rejected");
    assert!(err.is_validation());

    let err = client
        .apply_local_mutation(
            EntityKind::Plant,
            "p1",
            ChangeOp::Update,
            json!({ "wateringFrequency": 0 }),
        )
        .await
        .expect_err("zero frequency rejected");
    assert!(err.is_validation());
    assert_eq!(client.queue().len().await?, 1);
    Ok(())
}

#[tokio::test]
async fn malformed_update_is_rejected_before_it_reaches_the_snapshot() -> Result<()> {
    let h = harness().await;
    let client = &h.state.client;
    let user = UserId::new("u1");
    client
        .apply_local_mutation(EntityKind::Plant, "p1", ChangeOp::Create, plant_payload("u1", "Fern"))
        .await?;

    for patch in [
        json!({ "watering_frequency_days": "weekly" }),
        json!({ "active": "yes" }),
        json!({ "sunlight": "bright" }),
    ] {
        let err = client
            .apply_local_mutation(EntityKind::Plant, "p1", ChangeOp::Update, patch)
            .await
            .expect_err("malformed update rejected");
        assert!(err.is_validation());
    }

    assert_eq!(client.queue().len().await?, 1);
    let local = client.snapshot().get(EntityKind::Plant, "p1").await?;
    assert!(local.body.get("watering_frequency_days").is_none());
    assert_eq!(client.get_statistics(&user).await?.total_plants, 1);
    Ok(())
}
