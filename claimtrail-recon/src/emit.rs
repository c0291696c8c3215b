//! Downstream output
//!
//! Finished record projections leave the pipeline through an
//! [`OutputSink`]. Production uses the HTTP sink; when no output URL is
//! configured the projections are logged and dropped.

use crate::error::{TaskError, TaskResult};
use crate::models::RecordClaimsOutput;
use async_trait::async_trait;
use claimtrail_common::config::ReconConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn push(&self, output: &RecordClaimsOutput) -> TaskResult<()>;
}

/// POSTs each projection to the configured consumer endpoint
pub struct HttpSink {
    http_client: reqwest::Client,
    output_url: String,
    api_token: String,
}

impl HttpSink {
    pub fn new(output_url: String, api_token: String) -> TaskResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TaskError::Fatal(format!("http client init: {}", e)))?;
        Ok(Self {
            http_client,
            output_url,
            api_token,
        })
    }
}

#[async_trait]
impl OutputSink for HttpSink {
    async fn push(&self, output: &RecordClaimsOutput) -> TaskResult<()> {
        let response = self
            .http_client
            .post(&self.output_url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_token),
            )
            .json(output)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TaskError::Retryable(format!(
                "output sink {}: {}",
                output.record_id, status
            )));
        }
        if !status.is_success() {
            return Err(TaskError::Fatal(format!(
                "output sink {}: {}",
                output.record_id, status
            )));
        }
        debug!(record = %output.record_id, "Pushed record claims");
        Ok(())
    }
}

/// Logs projections and drops them; used when no consumer is configured
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn push(&self, output: &RecordClaimsOutput) -> TaskResult<()> {
        info!(
            record = %output.record_id,
            verified = output.verified.iter().filter(|v| *v != "-").count(),
            unverified = output.unverified.iter().filter(|v| *v != "-").count(),
            "Record claims ready (no output sink configured)"
        );
        Ok(())
    }
}

/// Forwards projections to an in-process channel; test seam
pub struct ChannelSink {
    sender: tokio::sync::mpsc::UnboundedSender<RecordClaimsOutput>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<RecordClaimsOutput>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn push(&self, output: &RecordClaimsOutput) -> TaskResult<()> {
        self.sender
            .send(output.clone())
            .map_err(|_| TaskError::Fatal("output channel closed".to_string()))
    }
}

/// Sink selection from configuration
pub fn sink_from_config(config: &ReconConfig) -> TaskResult<Arc<dyn OutputSink>> {
    match &config.output_url {
        Some(url) => Ok(Arc::new(HttpSink::new(url.clone(), config.api_token.clone())?)),
        None => Ok(Arc::new(NullSink)),
    }
}
