//! Poll stage
//!
//! Walks the "profiles touched since" endpoint from the `last.check`
//! checkpoint, advancing the checkpoint before fanning identities out so
//! a crash mid-batch re-enumerates instead of double-queuing. The
//! checkpoint also enforces the minimum poll interval across restarts.

use super::{FailedTask, FetchRequest, PipelineContext, POLL_STAGE};
use crate::db::kv;
use crate::error::{TaskError, TaskResult};
use chrono::{DateTime, Utc};
use claimtrail_common::time;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn run_poll_loop(
    ctx: Arc<PipelineContext>,
    fetch_tx: mpsc::Sender<FetchRequest>,
    errors: mpsc::UnboundedSender<FailedTask>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(ctx.config.poll_interval_secs);
    let mut consecutive_errors: u32 = 0;

    loop {
        match poll_once(&ctx, &fetch_tx).await {
            Ok(queued) => {
                consecutive_errors = 0;
                if queued > 0 {
                    info!(queued, "Poll queued identities for reconciliation");
                }
            }
            Err(e) if e.is_ignorable() => debug!(reason = %e, "Poll skipped"),
            Err(e) if e.is_retryable() => {
                consecutive_errors += 1;
                warn!(
                    error = %e,
                    consecutive_errors,
                    "Poll failed; backing off"
                );
                if consecutive_errors >= ctx.config.max_poll_errors {
                    let _ = errors.send(FailedTask {
                        stage: POLL_STAGE,
                        error: TaskError::Fatal(format!(
                            "poll failed {} times in a row: {}",
                            consecutive_errors, e
                        )),
                        payload: String::new(),
                    });
                    return;
                }
            }
            Err(e) => {
                let _ = errors.send(FailedTask {
                    stage: POLL_STAGE,
                    error: e,
                    payload: String::new(),
                });
                return;
            }
        }

        // the wait grows with the consecutive-error count and resets on
        // the first success
        let wait = interval * (consecutive_errors + 1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// One poll pass: enumerate every touched identity since the checkpoint
/// and queue a fetch for each. Returns the number queued.
pub async fn poll_once(
    ctx: &PipelineContext,
    fetch_tx: &mpsc::Sender<FetchRequest>,
) -> TaskResult<usize> {
    let checkpoint = read_checkpoint(ctx).await?;

    let elapsed = time::now().signed_duration_since(checkpoint);
    if elapsed < chrono::Duration::seconds(ctx.config.poll_interval_secs as i64) {
        return Err(TaskError::Ignorable(format!(
            "last check {}s ago, inside the minimum interval",
            elapsed.num_seconds()
        )));
    }

    let mut since = checkpoint;
    let mut queued = 0usize;

    loop {
        let page = ctx.profiles.updates_page(since).await?;
        if page.is_empty() {
            break;
        }

        let Some(newest) = page.iter().filter_map(|t| t.updated_at()).max() else {
            return Err(TaskError::Fatal(
                "updates page carries no parseable timestamps".to_string(),
            ));
        };

        // a page that does not advance the cursor would walk forever
        if newest <= since {
            debug!("Updates page did not advance the cursor; stopping walk");
            break;
        }

        // advance before fan-out: a crash mid-batch re-enumerates the
        // page rather than queuing it twice on top of a stale checkpoint
        kv::set(&ctx.pool, kv::LAST_CHECK, &time::format_rfc3339(newest)).await?;

        for touched in &page {
            debug!(identity = %touched.identity_id, "Queuing identity");
            fetch_tx
                .send(FetchRequest {
                    identity_id: touched.identity_id.clone(),
                    force: false,
                })
                .await
                .map_err(|_| TaskError::Fatal("fetch stage gone".to_string()))?;
            queued += 1;
        }

        since = newest;
    }

    Ok(queued)
}

async fn read_checkpoint(ctx: &PipelineContext) -> TaskResult<DateTime<Utc>> {
    let stored = kv::get(&ctx.pool, kv::LAST_CHECK).await?;
    Ok(stored
        .as_deref()
        .and_then(time::parse_rfc3339)
        .or_else(|| time::parse_rfc3339(time::EPOCH_DEFAULT))
        .unwrap_or_else(time::now))
}
