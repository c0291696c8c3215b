//! External collaborators
//!
//! HTTP clients for the identity-profile service and the bibliographic
//! search API, plus the read-through caches they own. The traits here are
//! the seams the diff engine and harvester are written against, so tests
//! can substitute canned collaborators.

pub mod cache;
pub mod metadata_client;
pub mod profile_client;

pub use cache::{Clock, SystemClock, TtlCache};
pub use metadata_client::{AuthoredDocument, DocumentMetadata, HttpMetadataClient};
pub use profile_client::{
    CuratedProfile, ExternalId, HttpProfileClient, IdentityProfile, ProfileWork, PublicName,
    TouchedIdentity,
};

use crate::error::TaskResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Identity-profile service seam
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch the full export profile (work list). `None` means the
    /// profile is missing or malformed: treat as "no data", not an error.
    async fn export_profile(&self, identity_id: &str) -> TaskResult<Option<IdentityProfile>>;

    /// Public name facts for the identity, if the public profile exists
    async fn public_profile(&self, identity_id: &str) -> TaskResult<Option<PublicName>>;

    /// Curated facts (authorization flag, affiliation, name variations)
    async fn curated_profile(&self, identity_id: &str) -> TaskResult<Option<CuratedProfile>>;

    /// One page of identities touched strictly after `since`. An empty
    /// page means the walk is complete.
    async fn updates_page(&self, since: DateTime<Utc>) -> TaskResult<Vec<TouchedIdentity>>;
}

/// Bibliographic metadata seam
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Resolve a document identifier to canonical id + author list.
    ///
    /// When `search_identifiers` is set the query matches against any
    /// known identifier rather than the canonical id alone.
    async fn resolve(
        &self,
        identifier: &str,
        search_identifiers: bool,
    ) -> TaskResult<DocumentMetadata>;

    /// Documents on which this identity appears in publisher-populated
    /// fields; used to harvest name variants.
    async fn works_for_identity(&self, identity_id: &str) -> TaskResult<Vec<AuthoredDocument>>;
}
