use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::AppError;
use crate::model::EntityKind;
use crate::store::Expect;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Why a queued create/delete (or an update racing a delete) could not be
/// applied automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// A create found a record already stored under the same id.
    AlreadyExists,
    /// The record changed remotely after the user deleted it offline.
    ChangedBeforeDelete,
    /// The record was deleted remotely while the user edited it offline.
    DeletedRemotely,
}

impl ConflictReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConflictReason::AlreadyExists => "already_exists",
            ConflictReason::ChangedBeforeDelete => "changed_before_delete",
            ConflictReason::DeletedRemotely => "deleted_remotely",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("version conflict on {kind} {id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        kind: EntityKind,
        id: String,
        expected: Expect,
        actual: Option<u64>,
    },
    #[error("stale write on {kind} {id}: event v{event_version}, store at v{observed}")]
    StaleWrite {
        kind: EntityKind,
        id: String,
        event_version: u64,
        observed: u64,
    },
    #[error("{handler} gave up on {kind} {id} after {attempts} attempts")]
    HandlerExhausted {
        handler: &'static str,
        kind: EntityKind,
        id: String,
        attempts: u32,
    },
    #[error("pending write #{seq} on {kind} {id} needs manual resolution ({reason})")]
    ManualResolutionRequired {
        seq: i64,
        kind: EntityKind,
        id: String,
        reason: ConflictReason,
    },
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("{operation} exceeded its {deadline_ms}ms deadline")]
    Timeout {
        operation: &'static str,
        deadline_ms: u64,
    },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SyncError {
    pub const MANUAL_RESOLUTION_CODE: &'static str = "SYNC/MANUAL_RESOLUTION";

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Errors the component that hit them retries locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::VersionConflict { .. }
                | SyncError::StaleWrite { .. }
                | SyncError::Timeout { .. }
                | SyncError::Storage(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NotFound { .. } => "SYNC/NOT_FOUND",
            SyncError::VersionConflict { .. } => "SYNC/VERSION_CONFLICT",
            SyncError::StaleWrite { .. } => "SYNC/STALE_WRITE",
            SyncError::HandlerExhausted { .. } => "SYNC/HANDLER_EXHAUSTED",
            SyncError::ManualResolutionRequired { .. } => Self::MANUAL_RESOLUTION_CODE,
            SyncError::Validation { .. } => "VALIDATION/PAYLOAD",
            SyncError::Timeout { .. } => "SYNC/TIMEOUT",
            SyncError::Storage(_) => "SYNC/STORAGE",
            SyncError::Codec(_) => "SYNC/CODEC",
        }
    }
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        let message = error.to_string();
        match error {
            SyncError::NotFound { kind, id } => AppError::new("SYNC/NOT_FOUND", message)
                .with_context("kind", kind.as_str())
                .with_context("id", id),
            SyncError::VersionConflict {
                kind,
                id,
                expected,
                actual,
            } => AppError::new("SYNC/VERSION_CONFLICT", message)
                .with_context("kind", kind.as_str())
                .with_context("id", id)
                .with_context("expected", expected.to_string())
                .with_context(
                    "actual",
                    actual.map(|v| v.to_string()).unwrap_or_else(|| "absent".into()),
                ),
            SyncError::StaleWrite {
                kind,
                id,
                event_version,
                observed,
            } => AppError::new("SYNC/STALE_WRITE", message)
                .with_context("kind", kind.as_str())
                .with_context("id", id)
                .with_context("event_version", event_version.to_string())
                .with_context("observed", observed.to_string()),
            SyncError::HandlerExhausted {
                handler,
                kind,
                id,
                attempts,
            } => AppError::new("SYNC/HANDLER_EXHAUSTED", message)
                .with_context("handler", handler)
                .with_context("kind", kind.as_str())
                .with_context("id", id)
                .with_context("attempts", attempts.to_string()),
            SyncError::ManualResolutionRequired {
                seq,
                kind,
                id,
                reason,
            } => AppError::new(SyncError::MANUAL_RESOLUTION_CODE, message)
                .with_context("seq", seq.to_string())
                .with_context("kind", kind.as_str())
                .with_context("id", id)
                .with_context("reason", reason.as_str()),
            SyncError::Validation { field, .. } => {
                let code = format!("VALIDATION/{}", field.to_ascii_uppercase());
                AppError::new(code, message).with_context("field", field)
            }
            SyncError::Timeout {
                operation,
                deadline_ms,
            } => AppError::new("SYNC/TIMEOUT", message)
                .with_context("operation", operation)
                .with_context("deadline_ms", deadline_ms.to_string()),
            SyncError::Storage(err) => AppError::from(err),
            SyncError::Codec(err) => AppError::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_field_scoped_code() {
        let err = SyncError::validation("activity_type", "unknown activity type: foo");
        assert!(!err.is_transient());
        let app: AppError = err.into();
        assert_eq!(app.code(), "VALIDATION/ACTIVITY_TYPE");
        assert!(app.is_validation());
        assert_eq!(app.context().get("field").map(String::as_str), Some("activity_type"));
    }

    #[test]
    fn manual_resolution_keeps_seq_and_reason() {
        let err = SyncError::ManualResolutionRequired {
            seq: 7,
            kind: EntityKind::Plant,
            id: "p1".into(),
            reason: ConflictReason::AlreadyExists,
        };
        let app: AppError = err.into();
        assert!(app.is_manual_resolution());
        assert_eq!(app.context().get("seq").map(String::as_str), Some("7"));
        assert_eq!(
            app.context().get("reason").map(String::as_str),
            Some("already_exists")
        );
    }

    #[test]
    fn conflict_reason_serializes_as_its_code() {
        for reason in [
            ConflictReason::AlreadyExists,
            ConflictReason::ChangedBeforeDelete,
            ConflictReason::DeletedRemotely,
        ] {
            let value = serde_json::to_value(reason).expect("serialize reason");
            assert_eq!(value, serde_json::Value::from(reason.as_str()));
        }
    }

    #[test]
    fn version_races_are_transient() {
        let err = SyncError::VersionConflict {
            kind: EntityKind::Plant,
            id: "p1".into(),
            expected: Expect::Version(2),
            actual: Some(3),
        };
        assert!(err.is_transient());
        assert_eq!(err.code(), "SYNC/VERSION_CONFLICT");
    }
}
