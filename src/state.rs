use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use sqlx::SqlitePool;

use crate::bus::OutboxBus;
use crate::config::SyncConfig;
use crate::db;
use crate::dispatch::{Engine, SettleReport};
use crate::handlers::Handlers;
use crate::notify::{NotificationSink, TracingSink};
use crate::queue::PendingQueue;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::SqliteEntityStore;
use crate::time::now_ms;
use crate::{client::LocalClient, AppError, AppResult};

/// Everything wired together: the authoritative side (store, outbox, engine)
/// and the client side (snapshot, queue, reconciler).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyncConfig>,
    pub authority: SqliteEntityStore,
    pub bus: OutboxBus,
    pub engine: Engine,
    pub client: LocalClient,
    pub reconciler: Reconciler,
    draining: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        authority_pool: SqlitePool,
        client_pool: SqlitePool,
        config: SyncConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let authority = SqliteEntityStore::authority(authority_pool.clone());
        let bus = OutboxBus::new(authority_pool);
        let handlers = Handlers::new(Arc::new(authority.clone()), sink, config.handler_max_attempts);
        let engine = Engine::new(Arc::new(bus.clone()), handlers, &config);

        let snapshot = SqliteEntityStore::snapshot(client_pool.clone());
        let queue = PendingQueue::new(client_pool, &config);
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(authority.clone()),
            snapshot.clone(),
            &config,
        );
        let client = LocalClient::new(queue, snapshot);

        Self {
            config: Arc::new(config),
            authority,
            bus,
            engine,
            client,
            reconciler,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open (and migrate) both databases named by `config`.
    pub async fn open(config: SyncConfig) -> anyhow::Result<Self> {
        let authority_pool = db::open_and_migrate(&config.authority_db_path())
            .await
            .context("open authority database")?;
        let client_pool = db::open_and_migrate(&config.client_db_path())
            .await
            .context("open client database")?;
        let state = Self::new(authority_pool, client_pool, config, Arc::new(TracingSink));
        state.client.queue().recover().await?;
        Ok(state)
    }

    pub fn begin_drain(&self) -> AppResult<DrainGuard> {
        DrainGuard::begin(self.draining.clone())
    }

    /// Push queued writes to the authoritative store. Only one drain runs at
    /// a time.
    pub async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let _guard = self.begin_drain()?;
        Ok(self.reconciler.drain(now_ms()).await?)
    }

    /// Reconcile, then run handlers until the authoritative side is quiet.
    pub async fn sync(&self) -> AppResult<(ReconcileReport, SettleReport)> {
        let reconciled = self.reconcile().await?;
        let settled = self.engine.run_until_idle().await?;
        Ok((reconciled, settled))
    }
}

pub struct DrainGuard {
    flag: Arc<AtomicBool>,
}

impl DrainGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                "SYNC/DRAIN_ACTIVE",
                "Reconciliation is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_guard_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = DrainGuard::begin(flag.clone()).expect("first guard");
        let err = DrainGuard::begin(flag.clone()).err().expect("second guard refused");
        assert_eq!(err.code(), "SYNC/DRAIN_ACTIVE");
        drop(first);
        assert!(DrainGuard::begin(flag).is_ok());
    }
}
