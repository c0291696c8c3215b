//! claimtrail-recon entry point
//!
//! `serve` runs the reconciliation pipeline plus the HTTP status
//! surface; the remaining subcommands are one-shot batch runs against
//! the same database.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use claimtrail_common::config::ReconConfig;
use claimtrail_common::{db, time};
use claimtrail_recon::api::{self, ApiState};
use claimtrail_recon::emit;
use claimtrail_recon::pipeline::{Pipeline, PipelineContext};
use claimtrail_recon::services::{HttpMetadataClient, HttpProfileClient};
use claimtrail_recon::{driver, importer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "claimtrail-recon", version, about = "Claim reconciliation service")]
struct Cli {
    /// Config file path (default: CLAIMTRAIL_CONFIG or the platform
    /// config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation pipeline and status API
    Serve,
    /// Bulk-import a tab-delimited claim file
    Import {
        /// Claim file, one `record<TAB>identity[...]` line per claim
        file: PathBuf,
    },
    /// Replay the claim log into the record projections
    Reindex {
        /// Replay entries created after this RFC3339 instant instead of
        /// the stored checkpoint
        #[arg(long)]
        since: Option<String>,
    },
    /// Re-send recently updated record projections to the output sink
    Repush {
        #[arg(long)]
        since: Option<String>,
    },
    /// Force-reconcile identities touched (or unvisited) since the
    /// checkpoint
    Refetch {
        #[arg(long)]
        since: Option<String>,
    },
    /// Print the stored checkpoints
    Kv,
}

fn parse_since(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => time::parse_rfc3339(raw)
            .map(Some)
            .with_context(|| format!("unparseable --since value: {}", raw)),
    }
}

async fn build_context(config: Arc<ReconConfig>) -> Result<Arc<PipelineContext>> {
    let pool = db::init_database_pool(&config.database_path).await?;
    let profiles = Arc::new(HttpProfileClient::new(&config)?);
    let metadata = Arc::new(HttpMetadataClient::new(&config)?);
    let sink = emit::sink_from_config(&config)?;
    Ok(Arc::new(PipelineContext::new(
        pool, config, profiles, metadata, sink,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(ReconConfig::load(cli.config.as_deref())?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database_path.display(),
        "Starting claimtrail-recon"
    );

    match cli.command {
        Command::Serve => {
            let ctx = build_context(config.clone()).await?;
            let pipeline = Pipeline::new(ctx.clone());
            let cancel = pipeline.cancel_token();

            let api_state = ApiState {
                pool: ctx.pool.clone(),
                startup_time: Utc::now(),
            };
            let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
            info!("Status API listening on http://{}", config.listen_addr);

            let api_cancel = cancel.clone();
            let api_task = tokio::spawn(async move {
                axum::serve(listener, api::router(api_state))
                    .with_graceful_shutdown(async move { api_cancel.cancelled().await })
                    .await
            });

            let shutdown_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    shutdown_cancel.cancel();
                }
            });

            let result = pipeline.run().await;
            cancel.cancel();
            api_task.await??;
            result
        }
        Command::Import { file } => {
            let pool = db::init_database_pool(&config.database_path).await?;
            let stored = importer::import_file(&pool, &file).await?;
            println!("Imported {} claims from {}", stored.len(), file.display());
            Ok(())
        }
        Command::Reindex { since } => {
            let ctx = build_context(config).await?;
            let since = parse_since(since.as_deref())?;
            let applied = driver::reindex(&ctx, since).await?;
            println!("Reindexed {} claims", applied);
            Ok(())
        }
        Command::Repush { since } => {
            let ctx = build_context(config).await?;
            let since = parse_since(since.as_deref())?;
            let pushed = driver::repush(&ctx, since).await?;
            println!("Repushed {} records", pushed);
            Ok(())
        }
        Command::Refetch { since } => {
            let ctx = build_context(config).await?;
            let since = parse_since(since.as_deref())?;
            let applied = driver::refetch(&ctx, since).await?;
            println!("Refetched; {} claims applied", applied);
            Ok(())
        }
        Command::Kv => {
            let pool = db::init_database_pool(&config.database_path).await?;
            for (key, value) in claimtrail_recon::db::kv::all(&pool).await? {
                println!("{}\t{}", key, value);
            }
            Ok(())
        }
    }
}
