//! Match stage
//!
//! Applies each enriched claim to its record's claim matrix and pushes
//! the finished projection to the output sink. Updates to one record are
//! serialized through a per-record async lock so concurrent workers
//! cannot interleave read-modify-write cycles on the same matrix.

use super::PipelineContext;
use crate::db::records;
use crate::error::TaskResult;
use crate::matrix::{apply_claim, ApplyOutcome};
use crate::models::{ClaimPayload, RecordClaimsOutput, RecordProjection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-record serialization locks, keyed by canonical record id.
/// Entries are evicted once their last holder releases, so the map does
/// not accumulate every record id ever matched.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    async fn lock_for(&self, record_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(record_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop one holder's clone under the map lock; when only the map
    /// still holds the entry, remove it. Clones are only ever handed out
    /// under the same map lock, so the strong count cannot race.
    async fn release(&self, record_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(record_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(record_id);
        }
    }
}

pub async fn process(
    ctx: &PipelineContext,
    locks: &RecordLocks,
    payload: &ClaimPayload,
) -> TaskResult<()> {
    let lock = locks.lock_for(&payload.record_id).await;
    let guard = lock.lock().await;
    let result = apply(ctx, payload).await;
    drop(guard);
    locks.release(&payload.record_id, lock).await;
    result
}

async fn apply(ctx: &PipelineContext, payload: &ClaimPayload) -> TaskResult<()> {
    let mut rec = match records::get(&ctx.pool, &payload.record_id).await? {
        Some(rec) => rec,
        None => RecordProjection::new(payload.record_id.clone(), Vec::new()),
    };

    let mut hydrated = false;
    if rec.authors.is_empty() {
        let metadata = ctx.metadata.resolve(&payload.record_id, false).await?;
        rec.authors = metadata.authors;
        hydrated = true;
    }

    match apply_claim(&mut rec, payload, ctx.config.min_ratio) {
        ApplyOutcome::NoOp => {
            warn!(
                record = %rec.record_id,
                identity = %payload.identity_id,
                "Claim matched no author position; dropped"
            );
            Ok(())
        }
        outcome => {
            debug!(
                record = %rec.record_id,
                identity = %payload.identity_id,
                ?outcome,
                "Applied claim"
            );
            let authors = hydrated.then_some(rec.authors.as_slice());
            records::upsert(&ctx.pool, &rec.record_id, &rec.claims, authors).await?;
            ctx.sink.push(&RecordClaimsOutput::from(&rec)).await
        }
    }
}
