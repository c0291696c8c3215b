//! Fetch stage
//!
//! Diffs one identity's live profile against the claim-log window since
//! the previous `#full-import` marker, appends the resulting entries, and
//! forwards the actionable ones. The identity's visited timestamp is
//! bumped whether or not anything changed.

use super::{FetchRequest, PipelineContext};
use crate::db::{claims, identities};
use crate::error::TaskResult;
use crate::models::ClaimPayload;
use tracing::{debug, info};

pub async fn process(
    ctx: &PipelineContext,
    request: &FetchRequest,
) -> TaskResult<Vec<ClaimPayload>> {
    let identity_id = request.identity_id.as_str();

    let marker = claims::latest_marker(&ctx.pool, identity_id).await?;
    let window = claims::entries_after(&ctx.pool, identity_id, marker.as_ref().and_then(|m| m.id))
        .await?;

    let diff_result = ctx
        .diff_engine
        .diff(identity_id, marker.as_ref(), &window, request.force)
        .await;

    // the profile was looked at either way
    identities::touch(&ctx.pool, identity_id, None).await?;

    let entries = diff_result?;
    if entries.is_empty() {
        debug!(identity = %identity_id, "Nothing to reconcile");
        return Ok(Vec::new());
    }

    let stored = claims::insert_claims(&ctx.pool, &entries).await?;

    // record ids in these entries came out of metadata resolution, so
    // the ingest stage need not resolve them again
    let forwarded: Vec<ClaimPayload> = stored
        .iter()
        .filter(|entry| !entry.status.is_terminal())
        .map(|entry| {
            let mut payload = ClaimPayload::from_entry(entry);
            payload.record_verified = true;
            payload
        })
        .collect();

    info!(
        identity = %identity_id,
        appended = stored.len(),
        forwarded = forwarded.len(),
        "Fetched and diffed profile"
    );
    Ok(forwarded)
}
