//! Domain types for claim reconciliation
//!
//! The claim log is the source of truth; records are a derived projection
//! that can be rebuilt from it at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::matrix::ClaimsMatrix;

/// Status of a claim-log entry.
///
/// `FullImport` is a marker bracketing one diff session: every entry after
/// the most recent marker for an identity is the work performed since that
/// checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Claimed,
    Updated,
    Removed,
    Unchanged,
    Forced,
    #[serde(rename = "#full-import")]
    FullImport,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Updated => "updated",
            ClaimStatus::Removed => "removed",
            ClaimStatus::Unchanged => "unchanged",
            ClaimStatus::Forced => "forced",
            ClaimStatus::FullImport => "#full-import",
        }
    }

    /// Entries with these statuses are informational and never forwarded
    /// to the ingest stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Unchanged | ClaimStatus::FullImport)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = claimtrail_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claimed" => Ok(ClaimStatus::Claimed),
            "updated" => Ok(ClaimStatus::Updated),
            "removed" => Ok(ClaimStatus::Removed),
            "unchanged" => Ok(ClaimStatus::Unchanged),
            "forced" => Ok(ClaimStatus::Forced),
            "#full-import" => Ok(ClaimStatus::FullImport),
            other => Err(claimtrail_common::Error::InvalidInput(format!(
                "Unknown claim status: {}",
                other
            ))),
        }
    }
}

/// Identity moderation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Blacklisted,
    Postponed,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Blacklisted => "blacklisted",
            IdentityStatus::Postponed => "postponed",
        }
    }
}

impl FromStr for IdentityStatus {
    type Err = claimtrail_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blacklisted" => Ok(IdentityStatus::Blacklisted),
            "postponed" => Ok(IdentityStatus::Postponed),
            other => Err(claimtrail_common::Error::InvalidInput(format!(
                "Unknown identity status: {}",
                other
            ))),
        }
    }
}

/// Harvested facts about an identity.
///
/// Required name-variant lists have dedicated fields; anything else the
/// harvester discovers travels in the open extension map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdentityFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Curated/display name variants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub author: Vec<String>,

    /// Publisher-normalized name variants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub author_norm: Vec<String>,

    /// "Surname, Given" as reported by the identity-profile service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orcid_name: Vec<String>,

    /// Generated abbreviated forms
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_name: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub authorized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_affiliation: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdentityFacts {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.author.is_empty()
            && self.author_norm.is_empty()
            && self.orcid_name.is_empty()
            && self.short_name.is_empty()
            && !self.authorized
            && self.current_affiliation.is_none()
            && self.extra.is_empty()
    }
}

/// An author identity row
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i64,
    pub identity_id: String,
    pub name: Option<String>,
    pub facts: IdentityFacts,
    pub status: Option<IdentityStatus>,
    pub account_id: Option<i64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub visited: Option<DateTime<Utc>>,
}

/// One immutable claim-log row.
///
/// `record_id` is empty for `#full-import` markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub identity_id: String,
    #[serde(default)]
    pub record_id: String,
    pub status: ClaimStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    pub created: DateTime<Utc>,
}

impl ClaimLogEntry {
    pub fn new(
        identity_id: impl Into<String>,
        record_id: impl Into<String>,
        status: ClaimStatus,
        provenance: Option<String>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            identity_id: identity_id.into(),
            record_id: record_id.into(),
            status,
            provenance,
            created,
        }
    }
}

/// Claim message flowing through the ingest and match stages.
///
/// Starts as a bare log entry and is enriched with identity facts at the
/// ingest boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<i64>,
    pub identity_id: String,
    pub record_id: String,
    pub status: ClaimStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    pub created: DateTime<Utc>,

    /// True when `record_id` is already canonical and needs no resolution
    #[serde(default)]
    pub record_verified: bool,

    /// Trusted account linkage at claim time; decides verified vs
    /// unverified placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,

    #[serde(default, skip_serializing_if = "IdentityFacts::is_empty")]
    pub facts: IdentityFacts,
}

impl ClaimPayload {
    pub fn from_entry(entry: &ClaimLogEntry) -> Self {
        Self {
            claim_id: entry.id,
            identity_id: entry.identity_id.clone(),
            record_id: entry.record_id.clone(),
            status: entry.status,
            provenance: entry.provenance.clone(),
            created: entry.created,
            record_verified: false,
            account_id: None,
            facts: IdentityFacts::default(),
        }
    }

    /// Ingest-boundary validation: both ids must be present.
    pub fn validate(&self) -> Result<(), claimtrail_common::Error> {
        if self.identity_id.trim().is_empty() {
            return Err(claimtrail_common::Error::InvalidInput(
                "claim payload missing identity id".to_string(),
            ));
        }
        if self.record_id.trim().is_empty() {
            return Err(claimtrail_common::Error::InvalidInput(
                "claim payload missing record id".to_string(),
            ));
        }
        Ok(())
    }
}

/// A publication record projection: ordered author list plus the
/// verified/unverified claim matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordProjection {
    pub record_id: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub claims: ClaimsMatrix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<DateTime<Utc>>,
}

impl RecordProjection {
    pub fn new(record_id: impl Into<String>, authors: Vec<String>) -> Self {
        Self {
            record_id: record_id.into(),
            authors,
            claims: ClaimsMatrix::default(),
            processed: None,
        }
    }
}

/// Final projection forwarded to the downstream consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordClaimsOutput {
    pub record_id: String,
    pub authors: Vec<String>,
    pub verified: Vec<String>,
    pub unverified: Vec<String>,
}

impl From<&RecordProjection> for RecordClaimsOutput {
    fn from(rec: &RecordProjection) -> Self {
        Self {
            record_id: rec.record_id.clone(),
            authors: rec.authors.clone(),
            verified: rec.claims.verified.clone(),
            unverified: rec.claims.unverified.clone(),
        }
    }
}
