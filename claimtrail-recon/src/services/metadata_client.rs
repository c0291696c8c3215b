//! Document metadata resolution client
//!
//! Resolves canonical and external document identifiers to a canonical
//! record id plus author list via the bibliographic search API.
//! Not-found and ambiguous results are ignorable; server errors are
//! retryable. Successful and negative lookups are cached.

use super::cache::TtlCache;
use super::MetadataSource;
use crate::error::{TaskError, TaskResult};
use crate::names;
use async_trait::async_trait;
use claimtrail_common::config::ReconConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("claimtrail/", env!("CARGO_PKG_VERSION"));

/// More hits than this means the identifier is junk, not ambiguous
const MAX_SANE_RESULTS: u64 = 10;

/// Canonical metadata for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub record_id: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

/// A document on which an identity appears, used for name harvesting.
/// The three lists are parallel arrays in canonical author order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoredDocument {
    pub record_id: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub authors_norm: Vec<String>,
    #[serde(default)]
    pub identity_ids: Vec<String>,
}

impl AuthoredDocument {
    /// Pick out the author/author_norm spellings at this identity's
    /// position, matching identifiers loosely.
    pub fn names_for(&self, identity_id: &str) -> Option<(Option<&str>, Option<&str>)> {
        let wanted = names::normalize_identifier(identity_id);
        let idx = self
            .identity_ids
            .iter()
            .position(|id| names::normalize_identifier(id) == wanted)?;
        Some((
            self.authors.get(idx).map(|s| s.as_str()),
            self.authors_norm.get(idx).map(|s| s.as_str()),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    response: SearchResponse,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    num_found: u64,
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchDoc {
    #[serde(default)]
    record_id: String,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    authors_norm: Vec<String>,
    #[serde(default)]
    identifiers: Vec<String>,
    #[serde(default)]
    identity_ids: Vec<String>,
}

/// HTTP implementation of [`MetadataSource`]
pub struct HttpMetadataClient {
    http_client: reqwest::Client,
    search_url: String,
    api_token: String,
    // Option::None entries remember failed resolutions so we do not hit
    // the API again for the same junk identifier
    resolve_cache: TtlCache<String, Option<DocumentMetadata>>,
}

impl HttpMetadataClient {
    pub fn new(config: &ReconConfig) -> TaskResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TaskError::Fatal(format!("http client init: {}", e)))?;

        Ok(Self {
            http_client,
            search_url: config.search_url.clone(),
            api_token: config.api_token.clone(),
            resolve_cache: TtlCache::new(Duration::from_secs(config.cache_ttl_secs), 2048),
        })
    }

    async fn search(&self, query: &str) -> TaskResult<SearchResponse> {
        let response = self
            .http_client
            .get(&self.search_url)
            .query(&[("q", query)])
            .header(reqwest::header::ACCEPT, "application/json")
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_token),
            )
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TaskError::Retryable(format!("search API: {}", status)));
        }
        if !status.is_success() {
            return Err(TaskError::Fatal(format!("search API: {}", status)));
        }

        let envelope: SearchEnvelope = response
            .json()
            .await
            .map_err(|e| TaskError::Fatal(format!("search payload: {}", e)))?;
        Ok(envelope.response)
    }
}

fn pick_document(
    identifier: &str,
    data: SearchResponse,
    searched_identifiers: bool,
) -> TaskResult<Option<SearchDoc>> {
    match data.num_found {
        1 => Ok(data.docs.into_iter().next()),
        0 => {
            if searched_identifiers {
                Err(TaskError::Ignorable(format!(
                    "No metadata found for identifier:{}",
                    identifier
                )))
            } else {
                Ok(None) // caller retries against all identifiers
            }
        }
        n if n > MAX_SANE_RESULTS => Err(TaskError::Ignorable(format!(
            "Insane number of results for {} ({})",
            identifier, n
        ))),
        _ => {
            let wanted = identifier.trim().to_lowercase();
            for doc in data.docs {
                if doc
                    .identifiers
                    .iter()
                    .any(|id| id.trim().to_lowercase() == wanted)
                {
                    return Ok(Some(doc));
                }
            }
            Err(TaskError::Ignorable(format!(
                "More than one document found for {}",
                identifier
            )))
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataClient {
    async fn resolve(
        &self,
        identifier: &str,
        search_identifiers: bool,
    ) -> TaskResult<DocumentMetadata> {
        let key = format!("{}:{}", search_identifiers, identifier);
        if let Some(cached) = self.resolve_cache.get(&key) {
            return cached.ok_or_else(|| {
                TaskError::Ignorable(format!("No metadata found for identifier:{}", identifier))
            });
        }

        let query = if search_identifiers {
            format!("identifier:\"{}\"", identifier)
        } else {
            format!("record_id:\"{}\"", identifier)
        };

        debug!(identifier = %identifier, query = %query, "Resolving document metadata");
        let data = self.search(&query).await?;

        let picked = match pick_document(identifier, data, search_identifiers) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                // canonical-id miss; widen to all identifiers
                return Box::pin(self.resolve(identifier, true)).await;
            }
            Err(err) => {
                if err.is_ignorable() {
                    self.resolve_cache.insert(key, None);
                }
                return Err(err);
            }
        };

        let metadata = DocumentMetadata {
            record_id: picked.record_id,
            authors: picked.authors,
            identifiers: picked.identifiers,
        };
        self.resolve_cache.insert(key, Some(metadata.clone()));
        Ok(metadata)
    }

    async fn works_for_identity(&self, identity_id: &str) -> TaskResult<Vec<AuthoredDocument>> {
        let query = format!(
            "identity_pub:{}",
            names::normalize_identifier(identity_id)
        );
        let data = self.search(&query).await?;

        Ok(data
            .docs
            .into_iter()
            .map(|doc| AuthoredDocument {
                record_id: doc.record_id,
                authors: doc.authors,
                authors_norm: doc.authors_norm,
                identity_ids: doc.identity_ids,
            })
            .collect())
    }
}
