//! Named checkpoint storage
//!
//! A single key/value table holding RFC3339 checkpoints: `last.check`
//! (poll stage), `last.reindex`, `last.repush`, `last.refetch` (batch
//! drivers).

use claimtrail_common::Result;
use sqlx::SqlitePool;

pub const LAST_CHECK: &str = "last.check";
pub const LAST_REINDEX: &str = "last.reindex";
pub const LAST_REPUSH: &str = "last.repush";
pub const LAST_REFETCH: &str = "last.refetch";

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM storage WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(value,)| value))
}

pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO storage (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// All checkpoints, sorted by key (for the `kv` CLI subcommand)
pub async fn all(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM storage ORDER BY key")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
