#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use plantkeeper_lib::bus::{Delivery, EventBus};
use plantkeeper_lib::config::SyncConfig;
use plantkeeper_lib::migrate;
use plantkeeper_lib::notify::CollectingSink;
use plantkeeper_lib::time::{now_ms, MS_PER_DAY};
use plantkeeper_lib::AppState;

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    migrate::apply_migrations(&pool)
        .await
        .expect("apply migrations");
    pool
}

/// Small budgets and millisecond backoff so retries happen within a test.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        handler_max_attempts: 3,
        handler_deadline_ms: 2_000,
        delivery_max_attempts: 3,
        queue_max_attempts: 3,
        backoff_base_ms: 1,
        backoff_cap_ms: 8,
        reconcile_deadline_ms: 2_000,
        reconcile_merge_attempts: 3,
        batch_size: 16,
        poll_interval_ms: 10,
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub state: AppState,
    pub sink: Arc<CollectingSink>,
    pub authority_pool: SqlitePool,
    pub client_pool: SqlitePool,
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: SyncConfig) -> Harness {
    let authority_pool = temp_pool().await;
    let client_pool = temp_pool().await;
    let sink = Arc::new(CollectingSink::new());
    let state = AppState::new(
        authority_pool.clone(),
        client_pool.clone(),
        config,
        sink.clone(),
    );
    Harness {
        state,
        sink,
        authority_pool,
        client_pool,
    }
}

pub fn plant_payload(owner: &str, nickname: &str) -> Value {
    json!({ "owner_id": owner, "nickname": nickname })
}

pub fn activity_payload(plant_id: &str, user: &str, activity_type: &str, performed_at: i64) -> Value {
    json!({
        "plant_id": plant_id,
        "user_id": user,
        "activity_type": activity_type,
        "performed_at": performed_at,
    })
}

pub fn days_ago(days: i64) -> i64 {
    now_ms() - days * MS_PER_DAY
}

/// Claim everything currently deliverable on `bus`.
pub async fn poll_all(bus: &dyn EventBus) -> Vec<Delivery> {
    bus.poll(1_000, now_ms()).await.expect("poll bus")
}
