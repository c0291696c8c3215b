//! Identity-profile service client
//!
//! Fetches export profiles (per-author work lists), public name facts,
//! curated facts, and "touched since" update pages. Rate-limited, with
//! read-through TTL caches for the profile lookups that tolerate
//! staleness. A missing or malformed profile is "no data", never a task
//! failure.

use super::cache::TtlCache;
use super::ProfileSource;
use crate::error::{TaskError, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claimtrail_common::config::ReconConfig;
use claimtrail_common::time;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("claimtrail/", env!("CARGO_PKG_VERSION"));
const RATE_LIMIT_MS: u64 = 250;

/// One typed external identifier attached to a work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalId {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

/// One work entry in an export profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileWork {
    #[serde(default)]
    pub external_ids: Vec<ExternalId>,
    /// Fixed-point decimal epoch seconds, as the service reports it
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Export profile: the identity's current work list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProfile {
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub works: Vec<ProfileWork>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExportEnvelope {
    #[serde(default)]
    profile: Option<IdentityProfile>,
}

/// Name facts from the public profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicName {
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub given_names: Option<String>,
}

/// Curated facts held by the identity service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuratedProfile {
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub current_affiliation: Option<String>,
    #[serde(default)]
    pub name_variations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CuratedEnvelope {
    #[serde(default)]
    info: Option<CuratedProfile>,
}

/// One row of an updates page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchedIdentity {
    pub identity_id: String,
    pub updated: String,
}

impl TouchedIdentity {
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        time::parse_rfc3339(&self.updated)
    }
}

/// Minimum-interval limiter shared across all calls of one client
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::trace!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// HTTP implementation of [`ProfileSource`]
pub struct HttpProfileClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    api_token: String,
    export_url: String,
    public_url: String,
    updates_url: String,
    public_cache: TtlCache<String, Option<PublicName>>,
    curated_cache: TtlCache<String, Option<CuratedProfile>>,
}

impl HttpProfileClient {
    pub fn new(config: &ReconConfig) -> TaskResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TaskError::Fatal(format!("http client init: {}", e)))?;

        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
            api_token: config.api_token.clone(),
            export_url: config.profile_export_url.clone(),
            public_url: config.public_profile_url.clone(),
            updates_url: config.profile_updates_url.clone(),
            public_cache: TtlCache::new(ttl, 1024),
            curated_cache: TtlCache::new(ttl, 1024),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_token)
    }
}

#[async_trait]
impl ProfileSource for HttpProfileClient {
    async fn export_profile(&self, identity_id: &str) -> TaskResult<Option<IdentityProfile>> {
        self.rate_limiter.wait().await;

        let url = self.export_url.replace("{id}", identity_id);
        debug!(identity = %identity_id, url = %url, "Fetching export profile");

        let response = self
            .http_client
            .get(&url)
            .query(&[("reload", "true")])
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TaskError::Retryable(format!(
                "profile export {}: {}",
                identity_id, status
            )));
        }
        if !status.is_success() {
            warn!(identity = %identity_id, %status, "Missing profile");
            return Ok(None);
        }

        match response.json::<ExportEnvelope>().await {
            Ok(envelope) => Ok(envelope.profile),
            Err(e) => {
                warn!(identity = %identity_id, error = %e, "Malformed profile; treating as no data");
                Ok(None)
            }
        }
    }

    async fn public_profile(&self, identity_id: &str) -> TaskResult<Option<PublicName>> {
        let key = identity_id.to_string();
        if let Some(cached) = self.public_cache.get(&key) {
            return Ok(cached);
        }

        self.rate_limiter.wait().await;
        let url = self.public_url.replace("{id}", identity_id);
        let response = self.http_client.get(&url).send().await?;

        let result = if response.status().is_success() {
            response.json::<PublicName>().await.ok()
        } else {
            None
        };

        self.public_cache.insert(key, result.clone());
        Ok(result)
    }

    async fn curated_profile(&self, identity_id: &str) -> TaskResult<Option<CuratedProfile>> {
        let key = identity_id.to_string();
        if let Some(cached) = self.curated_cache.get(&key) {
            return Ok(cached);
        }

        self.rate_limiter.wait().await;
        let url = self.export_url.replace("{id}", identity_id);
        let response = self
            .http_client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;

        let result = if response.status().is_success() {
            response
                .json::<CuratedEnvelope>()
                .await
                .ok()
                .and_then(|envelope| envelope.info)
        } else {
            None
        };

        self.curated_cache.insert(key, result.clone());
        Ok(result)
    }

    async fn updates_page(&self, since: DateTime<Utc>) -> TaskResult<Vec<TouchedIdentity>> {
        self.rate_limiter.wait().await;

        // strictly-after semantics: nudge the lower bound by one microsecond
        let since = since + chrono::Duration::microseconds(1);
        let url = self
            .updates_url
            .replace("{since}", &time::format_rfc3339(since));
        debug!(url = %url, "Fetching touched identities");

        let response = self
            .http_client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::Retryable(format!(
                "updates endpoint: {}",
                status
            )));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&body)
            .map_err(|e| TaskError::Fatal(format!("updates payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_interval() {
        let limiter = RateLimiter::new(500);
        assert_eq!(limiter.min_interval, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_rate_limiter_spacing() {
        let limiter = RateLimiter::new(100);
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_profile_deserializes_with_missing_fields() {
        let profile: IdentityProfile = serde_json::from_str(
            r#"{"works": [{"external_ids": [{"type": "doi", "value": "10.1/x"}]}]}"#,
        )
        .unwrap();
        assert!(profile.last_modified.is_none());
        assert_eq!(profile.works.len(), 1);
        assert!(profile.works[0].last_modified.is_none());
    }

    #[test]
    fn test_touched_identity_timestamp() {
        let touched = TouchedIdentity {
            identity_id: "0000-0001".to_string(),
            updated: "2020-05-01T12:00:00Z".to_string(),
        };
        assert!(touched.updated_at().is_some());

        let bad = TouchedIdentity {
            identity_id: "0000-0001".to_string(),
            updated: "yesterday".to_string(),
        };
        assert!(bad.updated_at().is_none());
    }
}
