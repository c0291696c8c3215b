//! Database bootstrap
//!
//! Opens the shared SQLite database and creates the claimtrail tables if
//! they do not exist. Status columns carry `CHECK` constraints so the
//! store rejects values outside the fixed enumerations even when a caller
//! forgets to validate first.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool and bootstrap tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create claimtrail tables if missing
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    // Named checkpoints (last.check, last.reindex, ...)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS storage (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id TEXT NOT NULL UNIQUE,
            name TEXT,
            facts TEXT,
            status TEXT CHECK (status IN ('blacklisted', 'postponed')),
            account_id INTEGER,
            created TEXT NOT NULL,
            updated TEXT NOT NULL,
            visited TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only claim log; rows are never updated or deleted
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS claims (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id TEXT NOT NULL,
            record_id TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL CHECK (status IN
                ('claimed', 'updated', 'removed', 'unchanged', 'forced', '#full-import')),
            provenance TEXT,
            created TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_claims_identity ON claims (identity_id, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL UNIQUE,
            claims TEXT,
            authors TEXT,
            created TEXT NOT NULL,
            updated TEXT NOT NULL,
            processed TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // History of identity fact changes discovered by harvesting
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created TEXT NOT NULL,
            key TEXT NOT NULL,
            oldvalue TEXT,
            newvalue TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (storage, identities, claims, records, change_log)");

    Ok(())
}
