//! Identity registry
//!
//! Identities are created lazily on first claim and refreshed by the
//! harvester. `visited` is bumped every time the pipeline processes the
//! identity, so stale identities can be found for re-fetching.

use crate::models::{Identity, IdentityFacts, IdentityStatus};
use chrono::{DateTime, Utc};
use claimtrail_common::{time, Error, Result};
use sqlx::SqlitePool;

type IdentityRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    String,
    String,
    Option<String>,
);

fn row_to_identity(row: IdentityRow) -> Result<Identity> {
    let (id, identity_id, name, facts, status, account_id, created, updated, visited) = row;
    let facts: IdentityFacts = match facts {
        Some(json) if !json.is_empty() => serde_json::from_str(&json)
            .map_err(|e| Error::Internal(format!("bad facts for {}: {}", identity_id, e)))?,
        _ => IdentityFacts::default(),
    };
    Ok(Identity {
        id,
        identity_id,
        name,
        facts,
        status: status.as_deref().map(str::parse).transpose()?,
        account_id,
        created: parse_ts(&created)?,
        updated: parse_ts(&updated)?,
        visited: visited.as_deref().map(parse_ts).transpose()?,
    })
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    time::parse_rfc3339(value)
        .ok_or_else(|| Error::Internal(format!("bad timestamp in identities: {}", value)))
}

pub async fn get(pool: &SqlitePool, identity_id: &str) -> Result<Option<Identity>> {
    let row: Option<IdentityRow> = sqlx::query_as(
        "SELECT id, identity_id, name, facts, status, account_id, created, updated, visited \
         FROM identities WHERE identity_id = ?",
    )
    .bind(identity_id)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_identity).transpose()
}

/// Insert a fresh identity row. `account_id` is 1 when the harvested
/// facts carry the authorized flag, absent otherwise.
pub async fn insert(
    pool: &SqlitePool,
    identity_id: &str,
    name: Option<&str>,
    facts: &IdentityFacts,
) -> Result<Identity> {
    let now = time::format_rfc3339(time::now());
    let account_id: Option<i64> = facts.authorized.then_some(1);
    sqlx::query(
        "INSERT INTO identities (identity_id, name, facts, account_id, created, updated, visited) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(identity_id)
    .bind(name)
    .bind(serde_json::to_string(facts).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(account_id)
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get(pool, identity_id)
        .await?
        .ok_or_else(|| Error::Internal(format!("identity {} vanished after insert", identity_id)))
}

/// Replace an identity's facts/name/account linkage, recording each
/// changed fact in `change_log`. Returns the refreshed row.
pub async fn update_facts(
    pool: &SqlitePool,
    identity: &Identity,
    new_facts: &IdentityFacts,
) -> Result<Identity> {
    let old = serde_json::to_value(&identity.facts).map_err(|e| Error::Internal(e.to_string()))?;
    let new = serde_json::to_value(new_facts).map_err(|e| Error::Internal(e.to_string()))?;

    let old_map = old.as_object().cloned().unwrap_or_default();
    let new_map = new.as_object().cloned().unwrap_or_default();

    let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut tx = pool.begin().await?;
    let now = time::format_rfc3339(time::now());
    let mut is_dirty = false;

    for key in keys {
        let old_value = old_map.get(key);
        let new_value = new_map.get(key);
        if old_value != new_value {
            sqlx::query(
                "INSERT INTO change_log (created, key, oldvalue, newvalue) VALUES (?, ?, ?, ?)",
            )
            .bind(&now)
            .bind(format!("{}:update:{}", identity.identity_id, key))
            .bind(old_value.map(|v| v.to_string()))
            .bind(new_value.map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;
            is_dirty = true;
        }
    }

    if is_dirty {
        let name = new_facts
            .name
            .clone()
            .or_else(|| identity.name.clone());
        let account_id: Option<i64> = new_facts.authorized.then_some(1);
        sqlx::query(
            "UPDATE identities SET facts = ?, name = ?, account_id = ?, updated = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(new_facts).map_err(|e| Error::Internal(e.to_string()))?)
        .bind(name)
        .bind(account_id)
        .bind(&now)
        .bind(identity.id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    get(pool, &identity.identity_id)
        .await?
        .ok_or_else(|| Error::NotFound(identity.identity_id.clone()))
}

/// Bump the visited timestamp. Returns false when the identity is
/// unknown.
pub async fn touch(
    pool: &SqlitePool,
    identity_id: &str,
    timestamp: Option<DateTime<Utc>>,
) -> Result<bool> {
    let ts = time::format_rfc3339(timestamp.unwrap_or_else(time::now));
    let result = sqlx::query("UPDATE identities SET visited = ? WHERE identity_id = ?")
        .bind(&ts)
        .bind(identity_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Identities not visited since `timestamp` (or never visited)
pub async fn untouched_since(
    pool: &SqlitePool,
    timestamp: DateTime<Utc>,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT identity_id FROM identities WHERE visited < ? OR visited IS NULL",
    )
    .bind(time::format_rfc3339(timestamp))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Moderation status check used by the ingest stage
pub fn is_rejected(status: Option<IdentityStatus>) -> bool {
    matches!(
        status,
        Some(IdentityStatus::Blacklisted) | Some(IdentityStatus::Postponed)
    )
}
