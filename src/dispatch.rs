//! Worker pool that drives handlers from the event bus.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, EventBus};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handlers::{HandlerOutcome, Handlers};
use crate::retry::{with_deadline, Backoff};
use crate::time::now_ms;

/// Upper bound on poll rounds for [`Engine::run_until_idle`].
const MAX_SETTLE_ROUNDS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Acked(HandlerOutcome),
    Retried,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettleReport {
    pub rounds: u32,
    pub delivered: u32,
    pub writes: u32,
    pub retried: u32,
    pub dead_lettered: u32,
}

impl SettleReport {
    fn absorb(&mut self, other: SettleReport) {
        self.rounds += other.rounds;
        self.delivered += other.delivered;
        self.writes += other.writes;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Clone)]
pub struct Engine {
    bus: Arc<dyn EventBus>,
    handlers: Handlers,
    backoff: Backoff,
    handler_deadline_ms: u64,
    delivery_max_attempts: u32,
    batch_size: u32,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(bus: Arc<dyn EventBus>, handlers: Handlers, config: &SyncConfig) -> Self {
        Self {
            bus,
            handlers,
            backoff: config.backoff(),
            handler_deadline_ms: config.handler_deadline_ms,
            delivery_max_attempts: config.delivery_max_attempts,
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Poll once and run the claimed deliveries. Deliveries for distinct keys
    /// run concurrently; the bus never hands out two events for one key.
    pub async fn tick(&self, now: i64) -> SyncResult<SettleReport> {
        let deliveries = self.bus.poll(self.batch_size, now).await?;
        let mut report = SettleReport {
            rounds: 1,
            delivered: u32::try_from(deliveries.len()).unwrap_or(u32::MAX),
            ..SettleReport::default()
        };
        let results = join_all(deliveries.into_iter().map(|d| self.process(d, now))).await;
        for result in results {
            match result? {
                Disposition::Acked(HandlerOutcome::Wrote) => report.writes += 1,
                Disposition::Acked(_) => {}
                Disposition::Retried => report.retried += 1,
                Disposition::DeadLettered => report.dead_lettered += 1,
            }
        }
        Ok(report)
    }

    /// Deliver until nothing is currently deliverable. Events waiting out a
    /// backoff are left for a later call.
    pub async fn run_until_idle(&self) -> SyncResult<SettleReport> {
        let mut total = SettleReport::default();
        for _ in 0..MAX_SETTLE_ROUNDS {
            let round = self.tick(now_ms()).await?;
            let idle = round.delivered == 0;
            total.absorb(round);
            if idle {
                break;
            }
        }
        debug!(target: "plantkeeper", event = "engine_settled", rounds = total.rounds, delivered = total.delivered);
        Ok(total)
    }

    /// Long-running loop. Returns once `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SyncResult<()> {
        info!(target: "plantkeeper", event = "engine_started", batch_size = self.batch_size);
        while !*shutdown.borrow() {
            let delivered = match self.tick(now_ms()).await {
                Ok(report) => report.delivered,
                Err(err) => {
                    warn!(target: "plantkeeper", event = "engine_tick_failed", error = %err);
                    0
                }
            };
            if delivered == 0 {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(target: "plantkeeper", event = "engine_stopped");
        Ok(())
    }

    async fn process(&self, delivery: Delivery, now: i64) -> SyncResult<Disposition> {
        let seq = delivery.event.seq;
        let result = with_deadline(
            "handler",
            self.handler_deadline_ms,
            self.handlers.handle(&delivery),
        )
        .await;

        let err = match result {
            Ok(outcome) => {
                self.bus.ack(seq).await?;
                return Ok(Disposition::Acked(outcome));
            }
            Err(err) => err,
        };

        let message = err.to_string();
        let exhausted = delivery.attempt >= self.delivery_max_attempts;
        let retryable = err.is_transient() || matches!(err, SyncError::HandlerExhausted { .. });
        if !retryable || exhausted {
            let event_name = if exhausted { "delivery_exhausted" } else { "handler_failed" };
            error!(
                target: "plantkeeper",
                event = event_name,
                seq,
                kind = %delivery.event.kind,
                id = %delivery.event.entity_id,
                op = %delivery.event.op,
                attempts = delivery.attempt,
                error = %message
            );
            self.bus.dead_letter(seq, &message).await?;
            return Ok(Disposition::DeadLettered);
        }

        // A stale write already knows the version to retry against.
        let (retry_at, observed) = match &err {
            SyncError::StaleWrite { observed, .. } => (now, Some(*observed)),
            _ => (self.backoff.next_at(now, delivery.attempt), None),
        };
        if let SyncError::HandlerExhausted { .. } = err {
            error!(target: "plantkeeper", event = "handler_exhausted", seq, error = %message, redelivery_at = retry_at);
        } else {
            debug!(target: "plantkeeper", event = "handler_retry_scheduled", seq, error = %message, retry_at);
        }
        self.bus.nack(seq, &message, retry_at, observed).await?;
        Ok(Disposition::Retried)
    }
}
