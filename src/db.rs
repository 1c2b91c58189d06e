use anyhow::{Context, Result as AnyResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

use crate::migrate;

pub async fn open_sqlite_pool(db_path: &Path) -> AnyResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "plantkeeper",
                error = %e,
                event = "db_dir_create_failed",
                path = %parent.display()
            );
            e
        })?;
    }
    tracing::info!(target: "plantkeeper", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(5_000))
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("open sqlite database {}", db_path.display()))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// Open a database and bring its schema up to date.
pub async fn open_and_migrate(db_path: &Path) -> AnyResult<Pool<Sqlite>> {
    let pool = open_sqlite_pool(db_path).await?;
    let ran = migrate::apply_migrations(&pool)
        .await
        .with_context(|| format!("apply migrations to {}", db_path.display()))?;
    if ran > 0 {
        tracing::info!(target: "plantkeeper", event = "db_migrated", path = %db_path.display(), migrations = ran);
    }
    Ok(pool)
}

/// Settings SQLite actually applied, which can differ from what was asked
/// for (in-memory databases ignore WAL, for one).
#[derive(Debug)]
struct EffectivePragmas {
    sqlite_version: String,
    journal_mode: String,
    synchronous: i64,
    foreign_keys: i64,
    busy_timeout_ms: i64,
}

async fn pragma<T>(pool: &Pool<Sqlite>, sql: &str, fallback: T) -> T
where
    T: Send + Unpin + for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap_or(fallback)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    let pragmas = EffectivePragmas {
        sqlite_version: pragma(pool, "SELECT sqlite_version()", String::from("unknown")).await,
        journal_mode: pragma(pool, "PRAGMA journal_mode", String::from("unknown")).await,
        synchronous: pragma(pool, "PRAGMA synchronous", i64::MIN).await,
        foreign_keys: pragma(pool, "PRAGMA foreign_keys", i64::MIN).await,
        busy_timeout_ms: pragma(pool, "PRAGMA busy_timeout", i64::MIN).await,
    };
    tracing::info!(
        target: "plantkeeper",
        event = "db_open",
        sqlite_version = %pragmas.sqlite_version,
        journal_mode = %pragmas.journal_mode,
        synchronous = pragmas.synchronous,
        foreign_keys = pragmas.foreign_keys,
        busy_timeout_ms = pragmas.busy_timeout_ms
    );
    if !pragmas.journal_mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(
            target: "plantkeeper",
            event = "db_open_warning",
            journal_mode = %pragmas.journal_mode,
            msg = "journal_mode != WAL; queued writes are less crash safe"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_file_database_in_wal_mode() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("client.sqlite3");
        let pool = open_and_migrate(&path).await.expect("open pool");
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
            .fetch_one(&pool)
            .await
            .expect("journal mode");
        assert!(mode.eq_ignore_ascii_case("wal"));
        assert!(path.exists());
        pool.close().await;
    }
}
