use sha2::{Digest, Sha256};
use sqlx::{Executor, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use tracing::{debug, error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        let head: String = trimmed.chars().take(160).collect();
        format!("{head}…")
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202510010900_entity_store.sql",
        include_str!("../migrations/202510010900_entity_store.sql"),
    ),
    (
        "202510010910_change_log.sql",
        include_str!("../migrations/202510010910_change_log.sql"),
    ),
    (
        "202510010920_pending_writes.sql",
        include_str!("../migrations/202510010920_pending_writes.sql"),
    ),
];

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Names of the embedded migrations, in application order.
pub fn known_migrations() -> impl Iterator<Item = &'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name)
}

/// Bring the schema up to date. Returns how many migrations ran; files
/// already applied are verified against their recorded checksum.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<usize> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum   TEXT NOT NULL\
         )",
    )
    .await?;

    let applied: HashMap<String, String> =
        sqlx::query_as::<_, (String, String)>("SELECT version, checksum FROM schema_migrations")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();

    let mut ran = 0;
    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let checksum = checksum(&cleaned);
        match applied.get(*filename) {
            Some(stored) if *stored == checksum => {
                debug!(target: "plantkeeper", event = "migration_skip_file", file = %filename);
            }
            Some(_) => anyhow::bail!("migration {filename} edited after application"),
            None => {
                apply_one(pool, filename, &cleaned, &checksum).await?;
                ran += 1;
            }
        }
    }
    Ok(ran)
}

async fn apply_one(pool: &SqlitePool, filename: &str, cleaned: &str, checksum: &str) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for stmt in cleaned.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        debug!(target: "plantkeeper", event = "migration_stmt", file = %filename, sql = %preview(stmt));
        sqlx::query(stmt).execute(&mut *tx).await.map_err(|e| {
            error!(target: "plantkeeper", event = "migration_stmt_error", file = %filename, sql = %preview(stmt), error = %e);
            e
        })?;
    }
    sqlx::query("INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)")
        .bind(filename)
        .bind(now_ms())
        .bind(checksum)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(target: "plantkeeper", event = "migration_file_applied", file = %filename);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:")
    }

    #[tokio::test]
    async fn applies_every_migration_once() {
        let pool = memory_pool().await;
        let first = apply_migrations(&pool).await.expect("first run");
        assert_eq!(first, known_migrations().count());
        let second = apply_migrations(&pool).await.expect("second run");
        assert_eq!(second, 0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("count migrations");
        assert_eq!(count as usize, known_migrations().count());
    }

    #[tokio::test]
    async fn edited_migration_is_rejected() {
        let pool = memory_pool().await;
        apply_migrations(&pool).await.expect("apply");
        sqlx::query("UPDATE schema_migrations SET checksum = 'tampered' WHERE version = ?")
            .bind("202510010900_entity_store.sql")
            .execute(&pool)
            .await
            .expect("tamper");
        let err = apply_migrations(&pool).await.expect_err("checksum mismatch");
        assert!(err.to_string().contains("edited after application"));
    }

    #[test]
    fn comments_do_not_affect_checksum() {
        let a = strip_comments("-- note\nCREATE TABLE t (id TEXT);");
        let b = strip_comments("CREATE TABLE t (id TEXT);\n-- trailing");
        assert_eq!(checksum(&a), checksum(&b));
    }
}
