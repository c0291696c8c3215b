//! Record projections
//!
//! Records are derived state, rebuildable from the claim log. Author
//! lists and claim matrices are stored as JSON text columns.

use crate::matrix::ClaimsMatrix;
use crate::models::RecordProjection;
use chrono::{DateTime, Utc};
use claimtrail_common::{time, Error, Result};
use sqlx::SqlitePool;

type RecordRow = (String, Option<String>, Option<String>, Option<String>);

fn row_to_record(row: RecordRow) -> Result<RecordProjection> {
    let (record_id, claims, authors, processed) = row;
    let claims: ClaimsMatrix = match claims {
        Some(json) if !json.is_empty() => serde_json::from_str(&json)
            .map_err(|e| Error::Internal(format!("bad claims for {}: {}", record_id, e)))?,
        _ => ClaimsMatrix::default(),
    };
    let authors: Vec<String> = match authors {
        Some(json) if !json.is_empty() => serde_json::from_str(&json)
            .map_err(|e| Error::Internal(format!("bad authors for {}: {}", record_id, e)))?,
        _ => Vec::new(),
    };
    Ok(RecordProjection {
        record_id,
        authors,
        claims,
        processed: processed.as_deref().and_then(time::parse_rfc3339),
    })
}

pub async fn get(pool: &SqlitePool, record_id: &str) -> Result<Option<RecordProjection>> {
    let row: Option<RecordRow> = sqlx::query_as(
        "SELECT record_id, claims, authors, processed FROM records WHERE record_id = ?",
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_record).transpose()
}

/// Store the result of processing: claim matrix and (optionally) a fresh
/// author list. Creates the record row when missing.
pub async fn upsert(
    pool: &SqlitePool,
    record_id: &str,
    claims: &ClaimsMatrix,
    authors: Option<&[String]>,
) -> Result<()> {
    let now = time::format_rfc3339(time::now());
    let claims_json = serde_json::to_string(claims).map_err(|e| Error::Internal(e.to_string()))?;
    let authors_json = authors
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO records (record_id, claims, authors, created, updated) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(record_id) DO UPDATE SET \
             claims = excluded.claims, \
             authors = COALESCE(excluded.authors, records.authors), \
             updated = excluded.updated",
    )
    .bind(record_id)
    .bind(&claims_json)
    .bind(&authors_json)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stamp the time a downstream consumer took the record
pub async fn mark_processed(pool: &SqlitePool, record_id: &str) -> Result<()> {
    let now = time::format_rfc3339(time::now());
    let result = sqlx::query("UPDATE records SET processed = ? WHERE record_id = ?")
        .bind(&now)
        .bind(record_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("record {}", record_id)));
    }
    Ok(())
}

/// Records updated at or after `since`, oldest first (repush driver)
pub async fn updated_since(
    pool: &SqlitePool,
    since: DateTime<Utc>,
) -> Result<Vec<RecordProjection>> {
    let rows: Vec<RecordRow> = sqlx::query_as(
        "SELECT record_id, claims, authors, processed FROM records \
         WHERE updated >= ? ORDER BY updated ASC",
    )
    .bind(time::format_rfc3339(since))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_record).collect()
}
