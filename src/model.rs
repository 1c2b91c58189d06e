use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{SyncError, SyncResult};
use crate::store::merge_fields;

pub const DEFAULT_WATERING_DAYS: u32 = 7;
pub const DEFAULT_FERTILIZING_DAYS: u32 = 30;
pub const NICKNAME_MAX_CHARS: usize = 80;
pub const NOTES_MAX_CHARS: usize = 2_000;

/// Entity kinds the store knows about. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Plant,
    CareActivity,
    User,
    DeletedPlant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Plant,
        EntityKind::CareActivity,
        EntityKind::User,
        EntityKind::DeletedPlant,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Plant => "plant",
            EntityKind::CareActivity => "care_activity",
            EntityKind::User => "user",
            EntityKind::DeletedPlant => "deleted_plant",
        }
    }

    /// Body fields the store lifts into indexed columns: `(owner, parent)`.
    pub fn index_fields(self, body: &Value) -> (Option<String>, Option<String>) {
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_owned);
        match self {
            EntityKind::Plant => (field("owner_id"), None),
            EntityKind::CareActivity => (field("user_id"), field("plant_id")),
            EntityKind::User => (None, None),
            EntityKind::DeletedPlant => (
                body.get("plant")
                    .and_then(|plant| plant.get("owner_id"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                None,
            ),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown entity kind: {0}")]
pub struct EntityKindError(String);

impl FromStr for EntityKind {
    type Err = EntityKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plant" => Ok(EntityKind::Plant),
            "care_activity" => Ok(EntityKind::CareActivity),
            "user" => Ok(EntityKind::User),
            "deleted_plant" => Ok(EntityKind::DeletedPlant),
            other => Err(EntityKindError(other.to_string())),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown operation: {0}")]
pub struct ChangeOpError(String);

impl FromStr for ChangeOp {
    type Err = ChangeOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeOp::Create),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            other => Err(ChangeOpError(other.to_string())),
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated user id as handed over by the auth provider. Trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Care activity types. Unknown strings are rejected, never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Watering,
    Fertilizing,
    Pruning,
    Repotting,
    Observation,
}

impl ActivityType {
    pub const ALL: [ActivityType; 5] = [
        ActivityType::Watering,
        ActivityType::Fertilizing,
        ActivityType::Pruning,
        ActivityType::Repotting,
        ActivityType::Observation,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ActivityType::Watering => "watering",
            ActivityType::Fertilizing => "fertilizing",
            ActivityType::Pruning => "pruning",
            ActivityType::Repotting => "repotting",
            ActivityType::Observation => "observation",
        }
    }

    pub fn iter() -> impl Iterator<Item = ActivityType> {
        Self::ALL.into_iter()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown activity type: {value}")]
pub struct ActivityTypeError {
    value: String,
}

impl ActivityTypeError {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl From<ActivityTypeError> for SyncError {
    fn from(err: ActivityTypeError) -> Self {
        SyncError::validation("activity_type", err.to_string())
    }
}

impl FromStr for ActivityType {
    type Err = ActivityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watering" => Ok(ActivityType::Watering),
            "fertilizing" => Ok(ActivityType::Fertilizing),
            "pruning" => Ok(ActivityType::Pruning),
            "repotting" => Ok(ActivityType::Repotting),
            "observation" => Ok(ActivityType::Observation),
            other => Err(ActivityTypeError::new(other)),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantStatus {
    Healthy,
    Thirsty,
}

/// Fields the handlers maintain on a plant. Clients never write these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CareSummary {
    #[serde(default)]
    pub total_care_actions: u32,
    #[serde(default)]
    pub last_care_action: Option<ActivityType>,
    #[serde(default)]
    pub last_care_date: Option<i64>,
    /// Activity ids already folded into `total_care_actions`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub counted_activities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    pub owner_id: String,
    #[serde(default)]
    pub template_id: Option<String>,
    pub nickname: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub watering_frequency_days: Option<u32>,
    #[serde(default)]
    pub fertilizing_frequency_days: Option<u32>,
    #[serde(default)]
    pub last_watered: Option<i64>,
    #[serde(default)]
    pub last_fertilized: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub plant_status: Option<PlantStatus>,
    #[serde(default)]
    pub care: CareSummary,
}

fn default_active() -> bool {
    true
}

impl Plant {
    pub fn new(owner: &UserId, nickname: impl Into<String>) -> Self {
        Plant {
            owner_id: owner.as_str().to_string(),
            template_id: None,
            nickname: nickname.into(),
            location: None,
            watering_frequency_days: None,
            fertilizing_frequency_days: None,
            last_watered: None,
            last_fertilized: None,
            active: true,
            plant_status: None,
            care: CareSummary::default(),
        }
    }

    pub fn watering_interval_days(&self) -> u32 {
        self.watering_frequency_days.unwrap_or(DEFAULT_WATERING_DAYS)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.owner_id.trim().is_empty() {
            return Err(SyncError::validation("owner_id", "plant must have an owner"));
        }
        let nickname_len = self.nickname.trim().chars().count();
        if nickname_len == 0 || nickname_len > NICKNAME_MAX_CHARS {
            return Err(SyncError::validation(
                "nickname",
                format!("nickname must be 1..={NICKNAME_MAX_CHARS} characters"),
            ));
        }
        if self.watering_frequency_days == Some(0) {
            return Err(SyncError::validation(
                "watering_frequency_days",
                "watering frequency must be at least one day",
            ));
        }
        if self.fertilizing_frequency_days == Some(0) {
            return Err(SyncError::validation(
                "fertilizing_frequency_days",
                "fertilizing frequency must be at least one day",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CareActivity {
    pub plant_id: String,
    pub user_id: String,
    pub activity_type: ActivityType,
    pub performed_at: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
}

impl CareActivity {
    pub fn validate(&self) -> SyncResult<()> {
        if self.plant_id.trim().is_empty() {
            return Err(SyncError::validation("plant_id", "activity must name its plant"));
        }
        if self.user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id", "activity must name its user"));
        }
        if self.performed_at <= 0 {
            return Err(SyncError::validation(
                "performed_at",
                "performed_at must be a positive timestamp",
            ));
        }
        if let Some(notes) = &self.notes {
            if notes.chars().count() > NOTES_MAX_CHARS {
                return Err(SyncError::validation(
                    "notes",
                    format!("notes are limited to {NOTES_MAX_CHARS} characters"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Point-in-time archive of a deleted plant. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedPlant {
    pub plant: Plant,
    pub original_version: u64,
    pub deleted_at: i64,
}

/// Typed bodies the store can hold.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;
}

impl Entity for Plant {
    const KIND: EntityKind = EntityKind::Plant;
}

impl Entity for CareActivity {
    const KIND: EntityKind = EntityKind::CareActivity;
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;
}

impl Entity for DeletedPlant {
    const KIND: EntityKind = EntityKind::DeletedPlant;
}

/// Versioned envelope around a stored body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: String,
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Client timestamp of the last reconciled write, per body field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_clocks: BTreeMap<String, i64>,
    pub body: T,
}

pub type RawRecord = Record<Value>;

impl RawRecord {
    pub fn decode<T: Entity>(self) -> SyncResult<Record<T>> {
        let body = serde_json::from_value(self.body)?;
        Ok(Record {
            id: self.id,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            field_clocks: self.field_clocks,
            body,
        })
    }
}

/// Stored name of a client-supplied field. Clients may send either the
/// stored snake_case name or the camelCase name older app builds used.
fn canonical_field(kind: EntityKind, key: &str) -> Option<&'static str> {
    let field = match (kind, key) {
        (EntityKind::Plant, "owner_id" | "ownerId" | "userId") => "owner_id",
        (EntityKind::Plant, "template_id" | "templateId" | "plantId") => "template_id",
        (EntityKind::Plant, "nickname") => "nickname",
        (EntityKind::Plant, "location") => "location",
        (
            EntityKind::Plant,
            "watering_frequency_days" | "wateringFrequencyDays" | "wateringFrequency",
        ) => "watering_frequency_days",
        (
            EntityKind::Plant,
            "fertilizing_frequency_days" | "fertilizingFrequencyDays" | "fertilizingFrequency",
        ) => "fertilizing_frequency_days",
        (EntityKind::Plant, "last_watered" | "lastWatered") => "last_watered",
        (EntityKind::Plant, "last_fertilized" | "lastFertilized") => "last_fertilized",
        (EntityKind::Plant, "active" | "isActive") => "active",
        (EntityKind::Plant, "plant_status" | "plantStatus") => "plant_status",
        (EntityKind::CareActivity, "plant_id" | "plantId" | "userPlantId") => "plant_id",
        (EntityKind::CareActivity, "user_id" | "userId") => "user_id",
        (EntityKind::CareActivity, "activity_type" | "activityType" | "type") => "activity_type",
        (EntityKind::CareActivity, "performed_at" | "performedAt") => "performed_at",
        (EntityKind::CareActivity, "notes") => "notes",
        (EntityKind::CareActivity, "amount") => "amount",
        (EntityKind::User, "display_name" | "displayName") => "display_name",
        (EntityKind::User, "email") => "email",
        _ => return None,
    };
    Some(field)
}

/// Rewrite a client payload onto stored field names. Unknown keys, keys the
/// server maintains and a field given under two spellings are rejected.
pub fn canonical_payload(kind: EntityKind, op: ChangeOp, payload: Value) -> SyncResult<Value> {
    if op == ChangeOp::Delete {
        return Ok(payload);
    }
    if kind == EntityKind::DeletedPlant {
        return Err(SyncError::validation(
            "kind",
            "archive records are written by the server only",
        ));
    }
    let Value::Object(object) = payload else {
        return Err(SyncError::validation("payload", "payload must be a JSON object"));
    };
    let mut canonical = serde_json::Map::with_capacity(object.len());
    for (key, value) in object {
        if kind == EntityKind::Plant && key == "care" {
            return Err(SyncError::validation(
                "care",
                "care summary is maintained by the server",
            ));
        }
        let Some(field) = canonical_field(kind, &key) else {
            return Err(SyncError::validation(
                "payload",
                format!("unknown {kind} field: {key}"),
            ));
        };
        if canonical.insert(field.to_string(), value).is_some() {
            return Err(SyncError::validation(
                "payload",
                format!("{field} is given more than once"),
            ));
        }
    }
    Ok(Value::Object(canonical))
}

/// Decode a whole body as `kind` and run its checks.
fn validate_body(kind: EntityKind, body: Value) -> SyncResult<()> {
    let invalid = |err: serde_json::Error| SyncError::validation("payload", err.to_string());
    match kind {
        EntityKind::Plant => serde_json::from_value::<Plant>(body).map_err(invalid)?.validate(),
        EntityKind::CareActivity => serde_json::from_value::<CareActivity>(body)
            .map_err(invalid)?
            .validate(),
        EntityKind::User => serde_json::from_value::<User>(body)
            .map(|_| ())
            .map_err(invalid),
        EntityKind::DeletedPlant => Err(SyncError::validation(
            "kind",
            "archive records are written by the server only",
        )),
    }
}

/// Validate a canonical client payload for `kind` before it reaches the
/// queue or store. Update payloads are partial, so only the fields they carry
/// are checked here; see [`validate_update`] for the merged check.
pub fn validate_payload(kind: EntityKind, op: ChangeOp, payload: &Value) -> SyncResult<()> {
    if op == ChangeOp::Delete {
        return Ok(());
    }
    let object = payload
        .as_object()
        .ok_or_else(|| SyncError::validation("payload", "payload must be a JSON object"))?;
    if let Some(raw) = object.get("activity_type") {
        let raw = raw
            .as_str()
            .ok_or_else(|| SyncError::validation("activity_type", "activity type must be a string"))?;
        ActivityType::from_str(raw)?;
    }
    if object.contains_key("care") {
        return Err(SyncError::validation(
            "care",
            "care summary is maintained by the server",
        ));
    }
    match (kind, op) {
        (EntityKind::DeletedPlant, _) => validate_body(kind, payload.clone()),
        (_, ChangeOp::Create) => validate_body(kind, payload.clone()),
        (EntityKind::Plant, ChangeOp::Update) => {
            for field in ["watering_frequency_days", "fertilizing_frequency_days"] {
                if object.get(field).and_then(Value::as_u64) == Some(0) {
                    return Err(SyncError::validation(
                        "frequency",
                        format!("{field} must be at least one day"),
                    ));
                }
            }
            if let Some(nickname) = object.get("nickname") {
                let ok = nickname
                    .as_str()
                    .map(|n| {
                        let len = n.trim().chars().count();
                        len > 0 && len <= NICKNAME_MAX_CHARS
                    })
                    .unwrap_or(false);
                if !ok {
                    return Err(SyncError::validation(
                        "nickname",
                        format!("nickname must be 1..={NICKNAME_MAX_CHARS} characters"),
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// An update must leave a body that still decodes and validates as `kind`.
pub fn validate_update(kind: EntityKind, current: &Value, patch: &Value) -> SyncResult<()> {
    let mut merged = current.clone();
    merge_fields(&mut merged, patch)?;
    validate_body(kind, merged)
}
