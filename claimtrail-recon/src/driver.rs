//! Batch drivers
//!
//! One-shot maintenance runs invoked from the CLI, each with its own
//! checkpoint: `reindex` replays the claim log into the record
//! projections, `repush` re-sends recently updated projections to the
//! output sink, `refetch` re-reconciles identities whose profiles moved
//! (or that have not been visited) since the checkpoint.

use crate::db::{claims, identities, kv, records};
use crate::error::{TaskError, TaskResult};
use crate::models::{ClaimPayload, RecordClaimsOutput};
use crate::pipeline::{fetch, ingest, match_stage, FetchRequest, PipelineContext};
use chrono::{DateTime, Utc};
use claimtrail_common::time;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Run one identity through fetch, ingest, and match in place. Returns
/// the number of claims applied.
pub async fn run_identity(
    ctx: &PipelineContext,
    locks: &match_stage::RecordLocks,
    request: &FetchRequest,
) -> TaskResult<usize> {
    let payloads = fetch::process(ctx, request).await?;
    let mut applied = 0;
    for payload in payloads {
        if apply_payload(ctx, locks, payload).await? {
            applied += 1;
        }
    }
    Ok(applied)
}

async fn apply_payload(
    ctx: &PipelineContext,
    locks: &match_stage::RecordLocks,
    payload: ClaimPayload,
) -> TaskResult<bool> {
    let enriched = match ingest::process(ctx, payload).await {
        Ok(Some(p)) => p,
        Ok(None) => return Ok(false),
        Err(e) if e.is_ignorable() => {
            debug!(reason = %e, "Dropped claim");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    match match_stage::process(ctx, locks, &enriched).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_ignorable() => {
            debug!(reason = %e, "Dropped claim");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Replay the claim log since the `last.reindex` checkpoint (or
/// `since`), rebuilding record projections from the log's final word on
/// each (identity, record) pair.
pub async fn reindex(
    ctx: &PipelineContext,
    since: Option<DateTime<Utc>>,
) -> TaskResult<usize> {
    let since = resolve_since(&ctx.pool, kv::LAST_REINDEX, since).await?;
    kv::set(&ctx.pool, kv::LAST_REINDEX, &time::format_rfc3339(time::now())).await?;

    let locks = match_stage::RecordLocks::default();
    let mut applied = 0;

    for identity_id in claims::distinct_identities(&ctx.pool).await? {
        let entries = claims::entries_created_after(&ctx.pool, &identity_id, since).await?;

        // later entries supersede earlier ones for the same record
        let mut latest: HashMap<String, _> = HashMap::new();
        for entry in entries {
            if entry.status.is_terminal() {
                continue;
            }
            latest.insert(entry.record_id.trim().to_lowercase(), entry);
        }

        for (_, entry) in latest {
            let payload = ClaimPayload::from_entry(&entry);
            match apply_payload(ctx, &locks, payload).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(identity = %identity_id, error = %e, "Reindex entry failed");
                }
            }
        }
    }

    info!(applied, since = %time::format_rfc3339(since), "Reindex complete");
    Ok(applied)
}

/// Re-push record projections updated since the `last.repush` checkpoint
/// (or `since`) to the output sink.
pub async fn repush(
    ctx: &PipelineContext,
    since: Option<DateTime<Utc>>,
) -> TaskResult<usize> {
    let since = resolve_since(&ctx.pool, kv::LAST_REPUSH, since).await?;
    kv::set(&ctx.pool, kv::LAST_REPUSH, &time::format_rfc3339(time::now())).await?;

    let mut pushed = 0;
    for rec in records::updated_since(&ctx.pool, since).await? {
        ctx.sink.push(&RecordClaimsOutput::from(&rec)).await?;
        records::mark_processed(&ctx.pool, &rec.record_id).await?;
        pushed += 1;
    }

    info!(pushed, since = %time::format_rfc3339(since), "Repush complete");
    Ok(pushed)
}

/// Force-reconcile every identity touched remotely since the
/// `last.refetch` checkpoint (or `since`), plus identities the pipeline
/// has not visited in that window.
pub async fn refetch(
    ctx: &PipelineContext,
    since: Option<DateTime<Utc>>,
) -> TaskResult<usize> {
    let since = resolve_since(&ctx.pool, kv::LAST_REFETCH, since).await?;
    kv::set(&ctx.pool, kv::LAST_REFETCH, &time::format_rfc3339(time::now())).await?;

    let mut wanted: BTreeSet<String> = BTreeSet::new();

    let mut cursor = since;
    loop {
        let page = ctx.profiles.updates_page(cursor).await?;
        if page.is_empty() {
            break;
        }
        let Some(newest) = page.iter().filter_map(|t| t.updated_at()).max() else {
            return Err(TaskError::Fatal(
                "updates page carries no parseable timestamps".to_string(),
            ));
        };
        if newest <= cursor {
            break;
        }
        wanted.extend(page.into_iter().map(|t| t.identity_id));
        cursor = newest;
    }

    wanted.extend(identities::untouched_since(&ctx.pool, since).await?);

    let locks = match_stage::RecordLocks::default();
    let mut applied = 0;
    for identity_id in &wanted {
        let request = FetchRequest {
            identity_id: identity_id.clone(),
            force: true,
        };
        match run_identity(ctx, &locks, &request).await {
            Ok(n) => applied += n,
            Err(e) if e.is_ignorable() => debug!(identity = %identity_id, reason = %e, "Skipped"),
            Err(e) => {
                warn!(identity = %identity_id, error = %e, "Refetch failed for identity");
            }
        }
    }

    info!(
        identities = wanted.len(),
        applied,
        since = %time::format_rfc3339(since),
        "Refetch complete"
    );
    Ok(applied)
}

async fn resolve_since(
    pool: &SqlitePool,
    key: &str,
    explicit: Option<DateTime<Utc>>,
) -> TaskResult<DateTime<Utc>> {
    if let Some(ts) = explicit {
        return Ok(ts);
    }
    let stored = kv::get(pool, key).await?;
    Ok(stored
        .as_deref()
        .and_then(time::parse_rfc3339)
        .or_else(|| time::parse_rfc3339(time::EPOCH_DEFAULT))
        .unwrap_or_else(time::now))
}
