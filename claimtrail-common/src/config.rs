//! Configuration loading for the reconciliation service
//!
//! Resolution order for each value: environment variable, then TOML config
//! file, then compiled default. The config file location itself can be
//! overridden with `CLAIMTRAIL_CONFIG`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Address for the status/health HTTP surface
    pub listen_addr: String,

    /// Bearer token for the identity-profile and search collaborators
    pub api_token: String,

    /// Identity-profile export endpoint; `{id}` is replaced with the
    /// identity identifier
    pub profile_export_url: String,

    /// "Profiles touched since {since}" enumeration endpoint
    pub profile_updates_url: String,

    /// Public profile endpoint (no auth), `{id}` placeholder
    pub public_profile_url: String,

    /// Bibliographic search endpoint for metadata resolution
    pub search_url: String,

    /// Downstream consumer for finished record projections (optional;
    /// projections are logged and dropped when unset)
    pub output_url: Option<String>,

    /// Minimum similarity ratio for author-position matching.
    ///
    /// The single most failure-prone tunable in the system.
    /// Experimental results show 0.69 to be the best value.
    pub min_ratio: f64,

    /// Grace window in seconds before a profile timestamp newer than the
    /// log counts as "updated" rather than "unchanged"
    pub update_grace_secs: i64,

    /// Minimum interval between remote update polls
    pub poll_interval_secs: u64,

    /// Per-task time-to-live before a stalled task is terminated
    pub task_ttl_secs: u64,

    /// Cap on consecutive poll errors before the pipeline gives up and
    /// surfaces the failure on the error channel
    pub max_poll_errors: u32,

    /// Worker count for the fetch+diff stage
    pub fetch_workers: usize,

    /// Worker count for the ingest stage
    pub ingest_workers: usize,

    /// Worker count for the match stage
    pub match_workers: usize,

    /// TTL for the read-through remote caches, seconds
    pub cache_ttl_secs: u64,

    /// Upper bound on the randomized delay between per-work external
    /// identifier lookups, milliseconds
    pub lookup_jitter_ms: u64,

    /// Priority per external identifier type when resolving a work to a
    /// canonical record. Higher wins; `*` is the fallback; negative
    /// priorities are skipped entirely.
    pub identifier_order: HashMap<String, i32>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        let mut identifier_order = HashMap::new();
        identifier_order.insert("canonical".to_string(), 9);
        identifier_order.insert("doi".to_string(), 8);
        identifier_order.insert("preprint".to_string(), 7);
        identifier_order.insert("*".to_string(), 0);

        Self {
            database_path: default_database_path(),
            listen_addr: "127.0.0.1:5740".to_string(),
            api_token: String::new(),
            profile_export_url: "https://api.example.org/v1/profiles/{id}/export".to_string(),
            profile_updates_url: "https://api.example.org/v1/profiles/updated/{since}".to_string(),
            public_profile_url: "https://public.example.org/v1/{id}/bio".to_string(),
            search_url: "https://api.example.org/v1/search/query".to_string(),
            output_url: None,
            min_ratio: 0.69,
            update_grace_secs: 60,
            poll_interval_secs: 300,
            task_ttl_secs: 60,
            max_poll_errors: 10,
            fetch_workers: 4,
            ingest_workers: 4,
            match_workers: 4,
            cache_ttl_secs: 3600,
            lookup_jitter_ms: 1000,
            identifier_order,
        }
    }
}

impl ReconConfig {
    /// Load configuration from an explicit path, the `CLAIMTRAIL_CONFIG`
    /// environment variable, or the platform config directory, applying
    /// environment overrides on top.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(explicit_path) {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Environment variables win over file values
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CLAIMTRAIL_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CLAIMTRAIL_API_TOKEN") {
            self.api_token = v;
        }
        if let Ok(v) = std::env::var("CLAIMTRAIL_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CLAIMTRAIL_MIN_RATIO") {
            match v.parse() {
                Ok(ratio) => self.min_ratio = ratio,
                Err(_) => warn!("Ignoring unparseable CLAIMTRAIL_MIN_RATIO: {}", v),
            }
        }
    }

    /// Highest-priority identifier candidates first; negative priorities
    /// are dropped.
    pub fn identifier_priority(&self, id_type: &str) -> Option<i32> {
        let key = id_type.trim().to_lowercase();
        let priority = self
            .identifier_order
            .get(&key)
            .or_else(|| self.identifier_order.get("*"))
            .copied()
            .unwrap_or(-1);
        (priority >= 0).then_some(priority)
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("CLAIMTRAIL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let candidate = dirs::config_dir()?.join("claimtrail").join("config.toml");
    candidate.exists().then_some(candidate)
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("claimtrail"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/claimtrail"))
        .join("claimtrail.db")
}
