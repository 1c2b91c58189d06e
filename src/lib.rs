//! Reactive consistency engine for a plant-care client.
//!
//! The authoritative side keeps derived plant state (schedules, care counts,
//! archives) consistent with primary writes by running idempotent handlers
//! off a transactional outbox. The client side queues writes made offline
//! and reconciles them when the server is reachable again.

pub mod bus;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatch;
mod error;
pub mod handlers;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod stats;
pub mod store;
pub mod time;

pub use client::{LocalClient, TentativeResult};
pub use config::{ConfigError, SyncConfig};
pub use dispatch::{Engine, SettleReport};
pub use error::{AppError, AppResult, ConflictReason, SyncError, SyncResult};
pub use model::{ActivityType, ChangeOp, EntityKind, UserId};
pub use state::AppState;
pub use stats::Statistics;
