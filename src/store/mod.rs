//! Versioned entity storage.
//!
//! [`EntityStore`] is the seam between the engine and whatever holds the
//! authoritative records: the SQLite implementation in [`sqlite`] or a remote
//! transport speaking the same contract. Every write bumps the record version
//! and refuses to overwrite when the caller's expectation does not match.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::model::{Entity, EntityKind, RawRecord, Record};

pub mod sqlite;

pub use sqlite::SqliteEntityStore;

/// Per-field client timestamps of the last reconciled write.
pub type FieldClocks = BTreeMap<String, i64>;

/// What the caller believes about the stored record before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Write unconditionally.
    Any,
    /// Create-only: fail if any record (live or deleted) holds the id.
    Absent,
    /// Write only if the live record is at exactly this version.
    Version(u64),
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Any => f.write_str("any"),
            Expect::Absent => f.write_str("absent"),
            Expect::Version(v) => write!(f, "v{v}"),
        }
    }
}

/// A single write request.
#[derive(Debug, Clone, PartialEq)]
pub struct Put {
    pub kind: EntityKind,
    pub id: String,
    pub body: Value,
    pub expect: Expect,
    /// Clocks merged into the stored ones (per-field max).
    pub clocks: FieldClocks,
}

impl Put {
    pub fn new(kind: EntityKind, id: impl Into<String>, body: Value) -> Self {
        Put {
            kind,
            id: id.into(),
            body,
            expect: Expect::Any,
            clocks: FieldClocks::new(),
        }
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    /// Stamp `fields` with the client timestamp that wrote them.
    pub fn clocked<'a>(mut self, client_ts: i64, fields: impl IntoIterator<Item = &'a str>) -> Self {
        for field in fields {
            self.clocks.insert(field.to_string(), client_ts);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    CreatedAsc,
    CreatedDesc,
    UpdatedDesc,
}

impl Order {
    pub(crate) const fn sql(self) -> &'static str {
        match self {
            Order::CreatedAsc => "created_at ASC, id ASC",
            Order::CreatedDesc => "created_at DESC, id DESC",
            Order::UpdatedDesc => "updated_at DESC, id DESC",
        }
    }
}

/// Listing filter. Only live (not deleted) records are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub owner_id: Option<String>,
    pub parent_id: Option<String>,
    pub order: Order,
    pub limit: Option<i64>,
}

impl Query {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Query {
            owner_id: Some(owner.into()),
            ..Query::default()
        }
    }

    pub fn children_of(parent: impl Into<String>) -> Self {
        Query {
            parent_id: Some(parent.into()),
            ..Query::default()
        }
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch a live record; deleted records report `NotFound`.
    async fn get(&self, kind: EntityKind, id: &str) -> SyncResult<RawRecord>;

    /// Create or replace a record. Returns the new version.
    async fn put(&self, put: Put) -> SyncResult<u64>;

    /// Soft-delete a record. Returns the record as it was when deleted.
    async fn delete(&self, kind: EntityKind, id: &str, expect: Expect) -> SyncResult<RawRecord>;

    /// List live records for display. Not used on the consistency path.
    async fn query(&self, kind: EntityKind, query: &Query) -> SyncResult<Vec<RawRecord>>;
}

pub type StoreHandle = Arc<dyn EntityStore>;

pub async fn get_entity<T: Entity>(store: &dyn EntityStore, id: &str) -> SyncResult<Record<T>> {
    store.get(T::KIND, id).await?.decode()
}

/// Like [`get_entity`] but maps `NotFound` to `None`.
pub async fn find_entity<T: Entity>(
    store: &dyn EntityStore,
    id: &str,
) -> SyncResult<Option<Record<T>>> {
    match get_entity::<T>(store, id).await {
        Ok(record) => Ok(Some(record)),
        Err(SyncError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn put_entity<T: Entity>(
    store: &dyn EntityStore,
    id: &str,
    body: &T,
    expect: Expect,
) -> SyncResult<u64> {
    let body = serde_json::to_value(body)?;
    store.put(Put::new(T::KIND, id, body).expect(expect)).await
}

pub async fn list_entities<T: Entity>(
    store: &dyn EntityStore,
    query: &Query,
) -> SyncResult<Vec<Record<T>>> {
    store
        .query(T::KIND, query)
        .await?
        .into_iter()
        .map(RawRecord::decode)
        .collect()
}

/// Shallow-merge `patch` into `base`. Both must be JSON objects.
pub fn merge_fields(base: &mut Value, patch: &Value) -> SyncResult<()> {
    let (Some(base), Some(patch)) = (base.as_object_mut(), patch.as_object()) else {
        return Err(SyncError::validation("payload", "expected JSON objects to merge"));
    };
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
    Ok(())
}
