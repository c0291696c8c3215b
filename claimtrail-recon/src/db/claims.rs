//! Append-only claim log
//!
//! Rows are never mutated or deleted. The one relaxation: inserting an
//! entry whose (created, identity, record) triple already exists reuses
//! the existing row, so replays stay idempotent. This is at-most-one-
//! per-instant bookkeeping, not a correctness guarantee.

use crate::models::{ClaimLogEntry, ClaimStatus};
use chrono::{DateTime, Utc};
use claimtrail_common::{time, Error, Result};
use sqlx::SqlitePool;

type ClaimRow = (i64, String, String, String, Option<String>, String);

fn row_to_entry(row: ClaimRow) -> Result<ClaimLogEntry> {
    let (id, identity_id, record_id, status, provenance, created) = row;
    Ok(ClaimLogEntry {
        id: Some(id),
        identity_id,
        record_id,
        status: status.parse()?,
        provenance,
        created: time::parse_rfc3339(&created)
            .ok_or_else(|| Error::Internal(format!("bad timestamp in claim {}: {}", id, created)))?,
    })
}

/// Persist a batch of claim entries in one transaction, reusing rows with
/// an identical (created, identity, record) triple. Returns the stored
/// entries with their ids.
pub async fn insert_claims(
    pool: &SqlitePool,
    entries: &[ClaimLogEntry],
) -> Result<Vec<ClaimLogEntry>> {
    let mut tx = pool.begin().await?;
    let mut stored = Vec::with_capacity(entries.len());

    for entry in entries {
        let created = time::format_rfc3339(entry.created);
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM claims WHERE created = ? AND identity_id = ? AND record_id = ?",
        )
        .bind(&created)
        .bind(&entry.identity_id)
        .bind(&entry.record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some((id,)) => id,
            None => {
                sqlx::query(
                    "INSERT INTO claims (identity_id, record_id, status, provenance, created) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&entry.identity_id)
                .bind(&entry.record_id)
                .bind(entry.status.as_str())
                .bind(&entry.provenance)
                .bind(&created)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            }
        };

        stored.push(ClaimLogEntry {
            id: Some(id),
            ..entry.clone()
        });
    }

    tx.commit().await?;
    Ok(stored)
}

/// Most recent `#full-import` marker for an identity
pub async fn latest_marker(
    pool: &SqlitePool,
    identity_id: &str,
) -> Result<Option<ClaimLogEntry>> {
    let row: Option<ClaimRow> = sqlx::query_as(
        "SELECT id, identity_id, record_id, status, provenance, created \
         FROM claims WHERE identity_id = ? AND status = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(identity_id)
    .bind(ClaimStatus::FullImport.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(row_to_entry).transpose()
}

/// Entries for an identity strictly after `after_id` (or the whole log
/// when `None`), in insertion order
pub async fn entries_after(
    pool: &SqlitePool,
    identity_id: &str,
    after_id: Option<i64>,
) -> Result<Vec<ClaimLogEntry>> {
    let rows: Vec<ClaimRow> = sqlx::query_as(
        "SELECT id, identity_id, record_id, status, provenance, created \
         FROM claims WHERE identity_id = ? AND id > ? ORDER BY id ASC",
    )
    .bind(identity_id)
    .bind(after_id.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_entry).collect()
}

/// Entries for an identity created after a point in time (bulk replay)
pub async fn entries_created_after(
    pool: &SqlitePool,
    identity_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<ClaimLogEntry>> {
    let rows: Vec<ClaimRow> = sqlx::query_as(
        "SELECT id, identity_id, record_id, status, provenance, created \
         FROM claims WHERE identity_id = ? AND created > ? ORDER BY id ASC",
    )
    .bind(identity_id)
    .bind(time::format_rfc3339(since))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_entry).collect()
}

/// Distinct identities present in the log
pub async fn distinct_identities(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT identity_id FROM claims")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
