//! Profile reconciliation
//!
//! Compares an identity's current exported work list against the claim
//! log and produces the new log entries that bring the log up to date.
//! Every session is bracketed by a `#full-import` marker stamped with the
//! profile's own modification time; the window since the previous marker
//! is what the fresh profile is compared against.

use crate::error::{TaskError, TaskResult};
use crate::models::{ClaimLogEntry, ClaimStatus};
use crate::services::{MetadataSource, ProfileSource, ProfileWork};
use chrono::{DateTime, Utc};
use claimtrail_common::config::ReconConfig;
use claimtrail_common::time;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Provenance stamped on entries the engine synthesizes itself
/// (removals have no originating source in the profile)
pub const ENGINE_PROVENANCE: &str = "claimtrail";

/// One resolved work from the exported profile
struct PresentWork {
    modified: DateTime<Utc>,
    provenance: Option<String>,
}

pub struct ProfileDiffEngine {
    profiles: Arc<dyn ProfileSource>,
    metadata: Arc<dyn MetadataSource>,
    config: Arc<ReconConfig>,
}

impl ProfileDiffEngine {
    pub fn new(
        profiles: Arc<dyn ProfileSource>,
        metadata: Arc<dyn MetadataSource>,
        config: Arc<ReconConfig>,
    ) -> Self {
        Self {
            profiles,
            metadata,
            config,
        }
    }

    /// Diff the identity's live profile against the log window since the
    /// previous `#full-import` marker. Returns the entries to append,
    /// marker first, or an empty vec when the profile has not moved.
    pub async fn diff(
        &self,
        identity_id: &str,
        marker: Option<&ClaimLogEntry>,
        window: &[ClaimLogEntry],
        force: bool,
    ) -> TaskResult<Vec<ClaimLogEntry>> {
        let profile = self
            .profiles
            .export_profile(identity_id)
            .await?
            .ok_or_else(|| {
                TaskError::Ignorable(format!("No profile for identity {}", identity_id))
            })?;

        let profile_time = profile
            .last_modified
            .as_deref()
            .and_then(time::parse_epoch_decimal)
            .unwrap_or_else(time::now);

        if let Some(marker) = marker {
            if !force && marker.created == profile_time {
                debug!(identity = %identity_id, "Profile unchanged since last import");
                return Ok(Vec::new());
            }
        }

        let present = self.resolve_works(identity_id, &profile.works, profile_time).await;

        // replay the window: the log's latest word on each record.
        // Comparison keys are lowercased; the original spelling is kept
        // for entries written back to the log.
        let mut updated: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut removed: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut spelling: HashMap<String, String> = HashMap::new();
        for entry in window {
            let key = entry.record_id.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            spelling.insert(key.clone(), entry.record_id.trim().to_string());
            if entry.status == ClaimStatus::Removed {
                updated.remove(&key);
                removed.insert(key, entry.created);
            } else {
                removed.remove(&key);
                updated.insert(key, entry.created);
            }
        }

        let mut entries = vec![ClaimLogEntry::new(
            identity_id,
            "",
            ClaimStatus::FullImport,
            Some(ENGINE_PROVENANCE.to_string()),
            profile_time,
        )];

        let grace = chrono::Duration::seconds(self.config.update_grace_secs);
        for (record_id, work) in &present {
            let key = record_id.trim().to_lowercase();
            let status = match updated.get(&key) {
                // the log already has it; a real move past the grace
                // window outranks a forced re-run, and a profile
                // timestamp at or behind the log is not an update
                Some(prior) => {
                    let delta = work.modified.signed_duration_since(*prior);
                    if delta > grace {
                        ClaimStatus::Updated
                    } else if force {
                        ClaimStatus::Forced
                    } else {
                        ClaimStatus::Unchanged
                    }
                }
                // new to the log, or re-appearing after a removal
                None => ClaimStatus::Claimed,
            };
            entries.push(ClaimLogEntry::new(
                identity_id,
                record_id.clone(),
                status,
                work.provenance.clone(),
                work.modified,
            ));
        }

        let present_keys: Vec<String> = present
            .keys()
            .map(|k| k.trim().to_lowercase())
            .collect();
        for key in updated.keys() {
            if !present_keys.contains(key) {
                let record_id = spelling.get(key).cloned().unwrap_or_else(|| key.clone());
                entries.push(ClaimLogEntry::new(
                    identity_id,
                    record_id,
                    ClaimStatus::Removed,
                    Some(ENGINE_PROVENANCE.to_string()),
                    time::now(),
                ));
            }
        }

        info!(
            identity = %identity_id,
            works = present.len(),
            entries = entries.len() - 1,
            "Reconciled profile"
        );
        Ok(entries)
    }

    /// Resolve each profile work to a canonical record id. Works that
    /// resolve to nothing are logged and dropped.
    async fn resolve_works(
        &self,
        identity_id: &str,
        works: &[ProfileWork],
        profile_time: DateTime<Utc>,
    ) -> HashMap<String, PresentWork> {
        let mut present = HashMap::new();

        for work in works {
            match self.resolve_one(work).await {
                Ok(Some(record_id)) => {
                    let modified = work
                        .last_modified
                        .as_deref()
                        .and_then(time::parse_epoch_decimal)
                        .unwrap_or(profile_time);
                    present.insert(
                        record_id,
                        PresentWork {
                            modified,
                            provenance: work.source.clone(),
                        },
                    );
                }
                Ok(None) => {
                    warn!(
                        identity = %identity_id,
                        ids = work.external_ids.len(),
                        "Dropping unresolvable profile work"
                    );
                }
                Err(e) => {
                    warn!(identity = %identity_id, error = %e, "Dropping profile work");
                }
            }
        }

        present
    }

    /// Try the work's external identifiers in priority order; the first
    /// one the metadata service resolves wins.
    async fn resolve_one(&self, work: &ProfileWork) -> TaskResult<Option<String>> {
        let mut candidates: Vec<(i32, &str)> = work
            .external_ids
            .iter()
            .filter_map(|id| {
                self.config
                    .identifier_priority(&id.id_type)
                    .map(|p| (p, id.value.as_str()))
            })
            .collect();
        candidates.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));

        for (_, value) in candidates {
            self.jitter().await;
            match self.metadata.resolve(value, false).await {
                Ok(metadata) => return Ok(Some(metadata.record_id)),
                Err(e) if e.is_ignorable() => {
                    debug!(identifier = %value, error = %e, "Identifier did not resolve");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // spreads lookups out so a large profile does not hammer the search
    // API in a burst
    async fn jitter(&self) {
        let max = self.config.lookup_jitter_ms;
        if max > 0 {
            let ms = rand::thread_rng().gen_range(0..max);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        AuthoredDocument, CuratedProfile, DocumentMetadata, ExternalId, IdentityProfile,
        PublicName, TouchedIdentity,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CannedProfile {
        profile: Option<IdentityProfile>,
    }

    #[async_trait]
    impl ProfileSource for CannedProfile {
        async fn export_profile(&self, _: &str) -> TaskResult<Option<IdentityProfile>> {
            Ok(self.profile.clone())
        }
        async fn public_profile(&self, _: &str) -> TaskResult<Option<PublicName>> {
            Ok(None)
        }
        async fn curated_profile(&self, _: &str) -> TaskResult<Option<CuratedProfile>> {
            Ok(None)
        }
        async fn updates_page(&self, _: DateTime<Utc>) -> TaskResult<Vec<TouchedIdentity>> {
            Ok(Vec::new())
        }
    }

    struct CannedResolver {
        // identifier value -> canonical record id
        known: HashMap<String, String>,
    }

    #[async_trait]
    impl MetadataSource for CannedResolver {
        async fn resolve(&self, identifier: &str, _: bool) -> TaskResult<DocumentMetadata> {
            match self.known.get(identifier) {
                Some(record_id) => Ok(DocumentMetadata {
                    record_id: record_id.clone(),
                    authors: Vec::new(),
                    identifiers: Vec::new(),
                }),
                None => Err(TaskError::Ignorable(format!(
                    "No metadata found for identifier:{}",
                    identifier
                ))),
            }
        }
        async fn works_for_identity(&self, _: &str) -> TaskResult<Vec<AuthoredDocument>> {
            Ok(Vec::new())
        }
    }

    fn work(ids: &[(&str, &str)], modified: Option<&str>, source: Option<&str>) -> ProfileWork {
        ProfileWork {
            external_ids: ids
                .iter()
                .map(|(t, v)| ExternalId {
                    id_type: t.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            last_modified: modified.map(|s| s.to_string()),
            source: source.map(|s| s.to_string()),
        }
    }

    fn engine(
        profile: Option<IdentityProfile>,
        known: &[(&str, &str)],
    ) -> ProfileDiffEngine {
        let mut config = ReconConfig::default();
        config.lookup_jitter_ms = 0;
        ProfileDiffEngine::new(
            Arc::new(CannedProfile { profile }),
            Arc::new(CannedResolver {
                known: known
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }),
            Arc::new(config),
        )
    }

    fn log_entry(record: &str, status: ClaimStatus, created: DateTime<Utc>) -> ClaimLogEntry {
        ClaimLogEntry::new("0000-0001", record, status, None, created)
    }

    fn status_of<'a>(entries: &'a [ClaimLogEntry], record: &str) -> Option<&'a ClaimLogEntry> {
        entries.iter().find(|e| e.record_id == record)
    }

    #[tokio::test]
    async fn test_missing_profile_is_ignorable() {
        let e = engine(None, &[]);
        let err = e.diff("0000-0001", None, &[], false).await.unwrap_err();
        assert!(err.is_ignorable());
    }

    #[tokio::test]
    async fn test_first_import_claims_everything() {
        let profile = IdentityProfile {
            last_modified: Some("1437080261.216".to_string()),
            works: vec![
                work(&[("doi", "10.1/a")], Some("1437080261.216"), Some("pub")),
                work(&[("doi", "10.1/b")], None, None),
            ],
        };
        let e = engine(Some(profile), &[("10.1/a", "2015A"), ("10.1/b", "2015B")]);
        let entries = e.diff("0000-0001", None, &[], false).await.unwrap();

        assert_eq!(entries[0].status, ClaimStatus::FullImport);
        assert_eq!(
            time::format_rfc3339(entries[0].created),
            "2015-07-16T20:57:41.216000Z"
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(status_of(&entries, "2015A").unwrap().status, ClaimStatus::Claimed);
        assert_eq!(
            status_of(&entries, "2015A").unwrap().provenance.as_deref(),
            Some("pub")
        );
        assert_eq!(status_of(&entries, "2015B").unwrap().status, ClaimStatus::Claimed);
    }

    #[tokio::test]
    async fn test_unchanged_profile_short_circuits() {
        let ts = time::parse_epoch_decimal("1437080261.216").unwrap();
        let profile = IdentityProfile {
            last_modified: Some("1437080261.216".to_string()),
            works: vec![work(&[("doi", "10.1/a")], None, None)],
        };
        let marker = log_entry("", ClaimStatus::FullImport, ts);

        let e = engine(Some(profile), &[("10.1/a", "2015A")]);
        let entries = e.diff("0000-0001", Some(&marker), &[], false).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_partitions_new_updated_unchanged_removed() {
        let t0 = time::parse_epoch_decimal("1437080261.216").unwrap();
        let t_new = t0 + chrono::Duration::hours(1);

        let profile = IdentityProfile {
            last_modified: Some(format!("{}.0", t_new.timestamp())),
            works: vec![
                // moved well past the grace window: updated
                work(&[("doi", "10.1/a")], Some(&format!("{}.0", t_new.timestamp())), None),
                // within the grace window: unchanged
                work(&[("doi", "10.1/b")], Some(&format!("{}.5", t0.timestamp())), None),
                // never seen before: claimed
                work(&[("doi", "10.1/c")], None, None),
            ],
        };
        let marker = log_entry("", ClaimStatus::FullImport, t0);
        let window = vec![
            log_entry("2015a", ClaimStatus::Claimed, t0),
            log_entry("2015b", ClaimStatus::Claimed, t0),
            // gone from the profile now: removal expected
            log_entry("2015d", ClaimStatus::Claimed, t0),
            // already removed and still absent: no new entry
            log_entry("2015e", ClaimStatus::Removed, t0),
        ];

        let e = engine(
            Some(profile),
            &[("10.1/a", "2015a"), ("10.1/b", "2015b"), ("10.1/c", "2015c")],
        );
        let entries = e.diff("0000-0001", Some(&marker), &window, false).await.unwrap();

        assert_eq!(entries[0].status, ClaimStatus::FullImport);
        assert_eq!(status_of(&entries, "2015a").unwrap().status, ClaimStatus::Updated);
        assert_eq!(status_of(&entries, "2015b").unwrap().status, ClaimStatus::Unchanged);
        assert_eq!(status_of(&entries, "2015c").unwrap().status, ClaimStatus::Claimed);
        let removal = status_of(&entries, "2015d").unwrap();
        assert_eq!(removal.status, ClaimStatus::Removed);
        assert_eq!(removal.provenance.as_deref(), Some(ENGINE_PROVENANCE));
        assert!(status_of(&entries, "2015e").is_none());
    }

    #[tokio::test]
    async fn test_force_overrides_unchanged() {
        let t0 = time::parse_epoch_decimal("1437080261.216").unwrap();
        let profile = IdentityProfile {
            last_modified: Some("1437080261.216".to_string()),
            works: vec![work(&[("doi", "10.1/a")], Some("1437080261.216"), None)],
        };
        let marker = log_entry("", ClaimStatus::FullImport, t0);
        let window = vec![log_entry("2015a", ClaimStatus::Claimed, t0)];

        let e = engine(Some(profile), &[("10.1/a", "2015a")]);
        let entries = e.diff("0000-0001", Some(&marker), &window, true).await.unwrap();
        assert_eq!(status_of(&entries, "2015a").unwrap().status, ClaimStatus::Forced);
    }

    #[tokio::test]
    async fn test_forced_run_still_reports_real_updates() {
        let t0 = time::parse_epoch_decimal("1437080261.216").unwrap();
        let t_new = t0 + chrono::Duration::hours(1);
        let profile = IdentityProfile {
            last_modified: Some(format!("{}.0", t_new.timestamp())),
            works: vec![work(
                &[("doi", "10.1/a")],
                Some(&format!("{}.0", t_new.timestamp())),
                None,
            )],
        };
        let marker = log_entry("", ClaimStatus::FullImport, t0);
        let window = vec![log_entry("2015a", ClaimStatus::Claimed, t0)];

        let e = engine(Some(profile), &[("10.1/a", "2015a")]);
        let entries = e.diff("0000-0001", Some(&marker), &window, true).await.unwrap();
        assert_eq!(status_of(&entries, "2015a").unwrap().status, ClaimStatus::Updated);
    }

    #[tokio::test]
    async fn test_profile_older_than_log_is_unchanged() {
        let t0 = time::now() - chrono::Duration::days(1);
        let t_old = t0 - chrono::Duration::hours(1);
        let profile = IdentityProfile {
            last_modified: Some(format!("{}.0", t_old.timestamp())),
            works: vec![work(
                &[("doi", "10.1/a")],
                Some(&format!("{}.0", t_old.timestamp())),
                None,
            )],
        };
        let marker = log_entry("", ClaimStatus::FullImport, t0);
        let window = vec![log_entry("2015a", ClaimStatus::Claimed, t0)];

        let e = engine(Some(profile), &[("10.1/a", "2015a")]);
        let entries = e.diff("0000-0001", Some(&marker), &window, false).await.unwrap();
        assert_eq!(status_of(&entries, "2015a").unwrap().status, ClaimStatus::Unchanged);
    }

    #[tokio::test]
    async fn test_reappearing_after_removal_is_claimed() {
        let t0 = time::now() - chrono::Duration::days(1);
        let profile = IdentityProfile {
            last_modified: None,
            works: vec![work(&[("doi", "10.1/a")], None, None)],
        };
        let marker = log_entry("", ClaimStatus::FullImport, t0);
        let window = vec![
            log_entry("2015a", ClaimStatus::Claimed, t0),
            log_entry("2015a", ClaimStatus::Removed, t0 + chrono::Duration::seconds(1)),
        ];

        let e = engine(Some(profile), &[("10.1/a", "2015a")]);
        let entries = e.diff("0000-0001", Some(&marker), &window, false).await.unwrap();
        assert_eq!(status_of(&entries, "2015a").unwrap().status, ClaimStatus::Claimed);
    }

    #[tokio::test]
    async fn test_identifier_priority_order_and_fallback() {
        let profile = IdentityProfile {
            last_modified: None,
            works: vec![
                // canonical outranks doi; canonical resolves
                work(&[("doi", "10.1/a"), ("canonical", "2015X")], None, None),
                // preferred id dead, lower-priority one resolves
                work(&[("canonical", "gone"), ("doi", "10.1/b")], None, None),
                // nothing resolves: dropped
                work(&[("doi", "junk")], None, None),
            ],
        };
        let e = engine(
            Some(profile),
            &[("2015X", "2015X"), ("10.1/a", "wrong"), ("10.1/b", "2015B")],
        );
        let entries = e.diff("0000-0001", None, &[], false).await.unwrap();

        assert!(status_of(&entries, "2015X").is_some());
        assert!(status_of(&entries, "wrong").is_none());
        assert!(status_of(&entries, "2015B").is_some());
        assert_eq!(entries.len(), 3); // marker + two resolved works
    }
}
