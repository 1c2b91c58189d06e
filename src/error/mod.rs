//! Errors at the UI boundary.
//!
//! Core components return [`SyncError`]. Anything handed to the UI layer is
//! flattened into [`AppError`], a serializable `{ code, message, context,
//! cause }` value whose codes stay stable across releases.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::error::Category;

mod sync;

pub use sync::{ConflictReason, SyncError, SyncResult};

/// SQLite primary result codes that clear up on their own.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Code for errors that carry no more specific classification.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: AppError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True when the error asks the user to pick a side of a conflict.
    pub fn is_manual_resolution(&self) -> bool {
        self.code == SyncError::MANUAL_RESOLUTION_CODE
    }

    pub fn is_validation(&self) -> bool {
        self.code.starts_with("VALIDATION/")
    }

    /// True when trying the same operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code.as_str(),
            "SYNC/VERSION_CONFLICT"
                | "SYNC/STALE_WRITE"
                | "SYNC/TIMEOUT"
                | "STORAGE/BUSY"
                | "STORAGE/POOL_TIMEOUT"
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            f.write_str(" (")?;
            for (i, (key, value)) in pairs.into_iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Keeps the whole context chain: the outermost message becomes the error,
/// each underlying source a nested cause.
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        if let Some(app) = error.downcast_ref::<AppError>() {
            return app.clone();
        }
        let mut links: Vec<String> = error.chain().map(ToString::to_string).collect();
        let mut built: Option<AppError> = None;
        while let Some(message) = links.pop() {
            let mut link = AppError::new(AppError::UNKNOWN_CODE, message);
            link.cause = built.map(Box::new);
            built = Some(link);
        }
        built.unwrap_or_else(|| AppError::new(AppError::UNKNOWN_CODE, error.to_string()))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        let code = match error.classify() {
            Category::Io => "JSON/IO",
            Category::Syntax => "JSON/SYNTAX",
            Category::Data => "JSON/DATA",
            Category::Eof => "JSON/EOF",
        };
        let mut app = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app = app
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::new("STORAGE/ROW_NOT_FOUND", "Record not found"),
            sqlx::Error::PoolTimedOut => AppError::new(
                "STORAGE/POOL_TIMEOUT",
                "Timed out waiting for a database connection",
            ),
            sqlx::Error::PoolClosed => AppError::new("STORAGE/CLOSED", "Database is closed"),
            sqlx::Error::Io(err) => AppError::new(format!("STORAGE/IO_{:?}", err.kind()), err.to_string()),
            sqlx::Error::Database(db) => {
                let sqlite_code = db.code().map(|code| code.into_owned());
                let primary = sqlite_code
                    .as_deref()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| (code & 0xff).to_string());
                let code = match primary.as_deref() {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => "STORAGE/BUSY",
                    _ if db.is_unique_violation() => "STORAGE/UNIQUE",
                    _ if db.is_foreign_key_violation() => "STORAGE/FOREIGN_KEY",
                    _ => "STORAGE/DATABASE",
                };
                let mut app = AppError::new(code, db.message().to_string());
                if let Some(sqlite_code) = sqlite_code {
                    app = app.with_context("sqlite_code", sqlite_code);
                }
                if let Some(constraint) = db.constraint() {
                    app = app.with_context("constraint", constraint.to_string());
                }
                app
            }
            sqlx::Error::ColumnDecode { index, source } => {
                AppError::new("STORAGE/DECODE", source.to_string()).with_context("column", index)
            }
            sqlx::Error::Decode(err) => AppError::new("STORAGE/DECODE", err.to_string()),
            other => AppError::new("STORAGE/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn anyhow_context_chain_becomes_nested_causes() {
        let err = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .context("open client database")
            .context("start sync")
            .unwrap_err();

        let app = AppError::from(err);
        assert_eq!(app.message(), "start sync");
        let middle = app.cause().expect("middle link");
        assert_eq!(middle.message(), "open client database");
        let root = middle.cause().expect("root link");
        assert!(root.message().contains("disk full"));
        assert!(root.cause().is_none());
    }

    #[test]
    fn wrapped_app_error_is_returned_unchanged() {
        let original = AppError::new("SYNC/DRAIN_ACTIVE", "busy");
        let app = AppError::from(anyhow::Error::new(original.clone()));
        assert_eq!(app, original);
    }

    #[test]
    fn storage_codes_mark_transient_failures() {
        let app = AppError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(app.code(), "STORAGE/POOL_TIMEOUT");
        assert!(app.is_retryable());
        assert!(!AppError::from(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn json_errors_carry_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"nickname\": }").unwrap_err();
        let app = AppError::from(err);
        assert_eq!(app.code(), "JSON/SYNTAX");
        assert_eq!(app.context().get("line").map(String::as_str), Some("1"));
    }

    #[test]
    fn serializes_flat_and_displays_sorted_context() {
        let error = AppError::new("VALIDATION/ACTIVITY_TYPE", "unknown activity type: foo")
            .with_context("value", "foo")
            .with_context("field", "activity_type");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value["code"], "VALIDATION/ACTIVITY_TYPE");
        assert_eq!(value["context"]["field"], "activity_type");
        assert!(value.get("cause").is_none());
        assert_eq!(
            error.to_string(),
            "[VALIDATION/ACTIVITY_TYPE] unknown activity type: foo (field=activity_type, value=foo)"
        );
    }
}
