//! Staged reconciliation pipeline
//!
//! Four stages connected by bounded channels:
//! - **Poll**: enumerates identities touched since the `last.check`
//!   checkpoint and fans them out to fetch.
//! - **Fetch**: diffs each identity's live profile against the claim log
//!   and appends the resulting entries.
//! - **Ingest**: validates claims, refreshes identity facts, resolves
//!   record ids, drops moderated identities.
//! - **Match**: applies each claim to its record's claim matrix and
//!   pushes finished projections to the output sink.
//!
//! Each stage runs a small worker pool. Handlers return [`TaskError`]:
//! ignorable failures are logged and dropped, retryable ones are retried
//! in place with backoff, fatal ones are parked on the error channel
//! with the task's payload attached. A failed task never stops the
//! pipeline; only shutdown or the poll stage giving up does.

pub mod fetch;
pub mod ingest;
pub mod match_stage;
pub mod poll;

use crate::diff::ProfileDiffEngine;
use crate::emit::OutputSink;
use crate::error::{TaskError, TaskResult};
use crate::harvest::Harvester;
use crate::models::ClaimPayload;
use crate::services::{MetadataSource, ProfileSource};
use claimtrail_common::config::ReconConfig;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 256;
const MAX_ATTEMPTS: u32 = 3;

/// Stage name the poll loop reports under; a failure from it means the
/// service can no longer make progress at all.
pub(crate) const POLL_STAGE: &str = "poll";

/// A task that failed fatally or exhausted its retries, parked with its
/// original payload for inspection.
#[derive(Debug)]
pub struct FailedTask {
    pub stage: &'static str,
    pub error: TaskError,
    pub payload: String,
}

/// One unit of work for the fetch stage
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub identity_id: String,
    /// Reprocess even when the profile timestamp says nothing moved
    pub force: bool,
}

/// Everything the stage handlers need, shared across workers
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Arc<ReconConfig>,
    pub profiles: Arc<dyn ProfileSource>,
    pub metadata: Arc<dyn MetadataSource>,
    pub harvester: Arc<Harvester>,
    pub diff_engine: Arc<ProfileDiffEngine>,
    pub sink: Arc<dyn OutputSink>,
}

impl PipelineContext {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ReconConfig>,
        profiles: Arc<dyn ProfileSource>,
        metadata: Arc<dyn MetadataSource>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let harvester = Arc::new(Harvester::new(profiles.clone(), metadata.clone()));
        let diff_engine = Arc::new(ProfileDiffEngine::new(
            profiles.clone(),
            metadata.clone(),
            config.clone(),
        ));
        Self {
            pool,
            config,
            profiles,
            metadata,
            harvester,
            diff_engine,
            sink,
        }
    }

    fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.config.task_ttl_secs)
    }
}

/// Run an operation under the task TTL, retrying retryable failures and
/// timeouts with doubling backoff.
pub(crate) async fn with_retry<T, F, Fut>(ttl: Duration, op_name: &str, f: F) -> TaskResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        let failure = match tokio::time::timeout(ttl, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => TaskError::Retryable(format!("{} exceeded {:?} TTL", op_name, ttl)),
        };
        if attempt >= MAX_ATTEMPTS {
            return Err(failure);
        }
        warn!(
            op = op_name,
            attempt,
            error = %failure,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

/// The running pipeline: spawned stage workers plus the shared shutdown
/// token and the fatal-error channel.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Failed tasks are parked and logged as they
    /// arrive; the pipeline itself stops only on shutdown or when the
    /// poll stage gives up.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (fetch_tx, fetch_rx) = mpsc::channel::<FetchRequest>(CHANNEL_CAPACITY);
        let (ingest_tx, ingest_rx) = mpsc::channel::<ClaimPayload>(CHANNEL_CAPACITY);
        let (match_tx, match_rx) = mpsc::channel::<ClaimPayload>(CHANNEL_CAPACITY);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<FailedTask>();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push(tokio::spawn(poll::run_poll_loop(
            self.ctx.clone(),
            fetch_tx.clone(),
            error_tx.clone(),
            self.cancel.clone(),
        )));

        let fetch_rx = Arc::new(Mutex::new(fetch_rx));
        for worker in 0..self.ctx.config.fetch_workers {
            let ctx = self.ctx.clone();
            let rx = fetch_rx.clone();
            let tx = ingest_tx.clone();
            let errors = error_tx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "Fetch worker started");
                while let Some(request) = next_message(&rx, &cancel).await {
                    let result = with_retry(ctx.task_ttl(), "fetch", || {
                        fetch::process(&ctx, &request)
                    })
                    .await;
                    dispatch(result, &request, &tx, &errors, "fetch").await;
                }
            }));
        }

        let ingest_rx = Arc::new(Mutex::new(ingest_rx));
        for worker in 0..self.ctx.config.ingest_workers {
            let ctx = self.ctx.clone();
            let rx = ingest_rx.clone();
            let tx = match_tx.clone();
            let errors = error_tx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "Ingest worker started");
                while let Some(payload) = next_message(&rx, &cancel).await {
                    let result = with_retry(ctx.task_ttl(), "ingest", || {
                        ingest::process(&ctx, payload.clone())
                    })
                    .await;
                    let forwarded = result.map(|p| p.into_iter().collect::<Vec<_>>());
                    dispatch(forwarded, &payload, &tx, &errors, "ingest").await;
                }
            }));
        }

        let match_rx = Arc::new(Mutex::new(match_rx));
        let locks = Arc::new(match_stage::RecordLocks::default());
        for worker in 0..self.ctx.config.match_workers {
            let ctx = self.ctx.clone();
            let rx = match_rx.clone();
            let locks = locks.clone();
            let errors = error_tx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "Match worker started");
                while let Some(payload) = next_message(&rx, &cancel).await {
                    let result = with_retry(ctx.task_ttl(), "match", || {
                        match_stage::process(&ctx, &locks, &payload)
                    })
                    .await;
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_ignorable() => {
                            debug!(stage = "match", reason = %e, "Dropped claim")
                        }
                        Err(e) => {
                            let _ = errors.send(FailedTask {
                                stage: "match",
                                error: e,
                                payload: format!("{:?}", payload),
                            });
                        }
                    }
                }
            }));
        }

        // the spawned workers hold their own clones
        drop(fetch_tx);
        drop(ingest_tx);
        drop(match_tx);
        drop(error_tx);

        info!("Pipeline running");
        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Pipeline shutting down");
                    break Ok(());
                }
                failed = error_rx.recv() => match failed {
                    Some(failed) if failed.stage == POLL_STAGE => {
                        error!(error = %failed.error, "Poll stage gave up; stopping pipeline");
                        self.cancel.cancel();
                        break Err(anyhow::anyhow!("pipeline failed: {}", failed.error));
                    }
                    Some(failed) => {
                        error!(
                            stage = failed.stage,
                            error = %failed.error,
                            payload = %failed.payload,
                            "Task failed; parked for inspection"
                        );
                    }
                    None => break Ok(()),
                }
            }
        };

        for handle in handles {
            let _ = handle.await;
        }
        outcome
    }
}

/// Receive the next message, or `None` on shutdown / closed channel
async fn next_message<T>(
    rx: &Arc<Mutex<mpsc::Receiver<T>>>,
    cancel: &CancellationToken,
) -> Option<T> {
    let mut rx = rx.lock().await;
    tokio::select! {
        _ = cancel.cancelled() => None,
        msg = rx.recv() => msg,
    }
}

/// Forward stage output, route failures by category. Fatal failures
/// carry the task's payload onto the error channel.
async fn dispatch<T, P: std::fmt::Debug>(
    result: TaskResult<Vec<T>>,
    task: &P,
    tx: &mpsc::Sender<T>,
    errors: &mpsc::UnboundedSender<FailedTask>,
    stage: &'static str,
) {
    match result {
        Ok(items) => {
            for item in items {
                if tx.send(item).await.is_err() {
                    warn!(stage, "Downstream stage gone; dropping output");
                    return;
                }
            }
        }
        Err(e) if e.is_ignorable() => debug!(stage, reason = %e, "Dropped task"),
        Err(e) => {
            let _ = errors.send(FailedTask {
                stage,
                error: e,
                payload: format!("{:?}", task),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::NullSink;
    use crate::services::{
        AuthoredDocument, CuratedProfile, DocumentMetadata, ExternalId, IdentityProfile,
        MetadataSource, ProfileSource, ProfileWork, PublicName, TouchedIdentity,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use claimtrail_common::config::ReconConfig;
    use claimtrail_common::db::init_memory_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_with_retry_passes_through_success() {
        let result: TaskResult<u32> =
            with_retry(Duration::from_secs(1), "t", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_attempts() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let result: TaskResult<u32> = with_retry(Duration::from_secs(1), "t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::Retryable("down".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_ignorable() {
        let calls = AtomicU32::new(0);
        let result: TaskResult<u32> = with_retry(Duration::from_secs(1), "t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::Ignorable("missing".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_ignorable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_times_out_stalled_task() {
        tokio::time::pause();
        let result: TaskResult<u32> = with_retry(Duration::from_millis(10), "t", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_dispatch_parks_fatal_with_payload() {
        let (tx, _rx) = mpsc::channel::<u32>(4);
        let (etx, mut erx) = mpsc::unbounded_channel();
        dispatch::<u32, _>(
            Err(TaskError::Fatal("401 Unauthorized".to_string())),
            &"claim-for-2020A",
            &tx,
            &etx,
            "fetch",
        )
        .await;

        let failed = erx.recv().await.unwrap();
        assert_eq!(failed.stage, "fetch");
        assert!(matches!(failed.error, TaskError::Fatal(_)));
        assert!(failed.payload.contains("claim-for-2020A"));
    }

    struct OneIdentity {
        pages: StdMutex<Vec<Vec<TouchedIdentity>>>,
    }

    #[async_trait]
    impl ProfileSource for OneIdentity {
        async fn export_profile(&self, _: &str) -> TaskResult<Option<IdentityProfile>> {
            Ok(Some(IdentityProfile {
                last_modified: None,
                works: vec![ProfileWork {
                    external_ids: vec![ExternalId {
                        id_type: "doi".to_string(),
                        value: "10.1/a".to_string(),
                    }],
                    last_modified: None,
                    source: None,
                }],
            }))
        }
        async fn public_profile(&self, _: &str) -> TaskResult<Option<PublicName>> {
            Ok(None)
        }
        async fn curated_profile(&self, _: &str) -> TaskResult<Option<CuratedProfile>> {
            Ok(None)
        }
        async fn updates_page(&self, _: DateTime<Utc>) -> TaskResult<Vec<TouchedIdentity>> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    /// Identifiers resolve but the per-identity works lookup is rejected
    struct WorksLookupDown;

    #[async_trait]
    impl MetadataSource for WorksLookupDown {
        async fn resolve(&self, identifier: &str, _: bool) -> TaskResult<DocumentMetadata> {
            Ok(DocumentMetadata {
                record_id: identifier.to_string(),
                authors: vec!["Stern, Daniel".to_string()],
                identifiers: Vec::new(),
            })
        }
        async fn works_for_identity(&self, _: &str) -> TaskResult<Vec<AuthoredDocument>> {
            Err(TaskError::Fatal("search API: 401 Unauthorized".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fatal_task_failure_does_not_stop_pipeline() {
        let pool = init_memory_pool().await.unwrap();
        let mut config = ReconConfig::default();
        config.lookup_jitter_ms = 0;
        let ctx = Arc::new(PipelineContext::new(
            pool,
            Arc::new(config),
            Arc::new(OneIdentity {
                pages: StdMutex::new(vec![vec![TouchedIdentity {
                    identity_id: "0000-0001".to_string(),
                    updated: "2020-01-01T00:00:00Z".to_string(),
                }]]),
            }),
            Arc::new(WorksLookupDown),
            Arc::new(NullSink),
        ));

        let pipeline = Pipeline::new(ctx);
        let cancel = pipeline.cancel_token();
        let handle = tokio::spawn(async move { pipeline.run().await });

        // the poisoned identity fails in ingest; the service keeps
        // running until told to stop
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
