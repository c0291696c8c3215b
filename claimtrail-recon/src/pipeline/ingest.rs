//! Ingest stage
//!
//! Validates each claim, refreshes the identity's harvested facts,
//! resolves the record id to its canonical form, and drops claims from
//! moderated identities. The payload that leaves this stage carries
//! everything the matcher needs.

use super::PipelineContext;
use crate::db::identities;
use crate::error::{TaskError, TaskResult};
use crate::models::ClaimPayload;
use tracing::debug;

pub async fn process(
    ctx: &PipelineContext,
    mut payload: ClaimPayload,
) -> TaskResult<Option<ClaimPayload>> {
    payload.validate()?;

    if payload.status.is_terminal() {
        debug!(
            identity = %payload.identity_id,
            record = %payload.record_id,
            status = %payload.status,
            "Terminal status; nothing to apply"
        );
        return Ok(None);
    }

    let identity = ctx
        .harvester
        .retrieve_identity(&ctx.pool, &payload.identity_id)
        .await?;

    if identities::is_rejected(identity.status) {
        return Err(TaskError::Ignorable(format!(
            "Identity {} is {}",
            identity.identity_id,
            identity
                .status
                .map(|s| s.as_str())
                .unwrap_or("moderated")
        )));
    }

    if !payload.record_verified {
        let metadata = ctx.metadata.resolve(&payload.record_id, false).await?;
        payload.record_id = metadata.record_id;
        payload.record_verified = true;
    }

    payload.facts = identity.facts;
    payload.account_id = identity.account_id;

    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::NullSink;
    use crate::models::{ClaimLogEntry, ClaimStatus, IdentityFacts, IdentityStatus};
    use crate::services::{
        AuthoredDocument, CuratedProfile, DocumentMetadata, IdentityProfile, MetadataSource,
        ProfileSource, PublicName, TouchedIdentity,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use claimtrail_common::config::ReconConfig;
    use claimtrail_common::db::init_memory_pool;
    use std::sync::Arc;

    struct CuratedOnly {
        curated: Option<CuratedProfile>,
    }

    #[async_trait]
    impl ProfileSource for CuratedOnly {
        async fn export_profile(&self, _: &str) -> TaskResult<Option<IdentityProfile>> {
            Ok(None)
        }
        async fn public_profile(&self, _: &str) -> TaskResult<Option<PublicName>> {
            Ok(Some(PublicName {
                family_name: Some("Stern".to_string()),
                given_names: Some("Daniel".to_string()),
            }))
        }
        async fn curated_profile(&self, _: &str) -> TaskResult<Option<CuratedProfile>> {
            Ok(self.curated.clone())
        }
        async fn updates_page(&self, _: DateTime<Utc>) -> TaskResult<Vec<TouchedIdentity>> {
            Ok(Vec::new())
        }
    }

    struct CanonicalResolver;

    #[async_trait]
    impl MetadataSource for CanonicalResolver {
        async fn resolve(&self, identifier: &str, _: bool) -> TaskResult<DocumentMetadata> {
            Ok(DocumentMetadata {
                record_id: identifier.to_uppercase(),
                authors: vec!["Stern, Daniel".to_string()],
                identifiers: Vec::new(),
            })
        }
        async fn works_for_identity(&self, _: &str) -> TaskResult<Vec<AuthoredDocument>> {
            Ok(Vec::new())
        }
    }

    async fn context(curated: Option<CuratedProfile>) -> PipelineContext {
        let pool = init_memory_pool().await.unwrap();
        PipelineContext::new(
            pool,
            Arc::new(ReconConfig::default()),
            Arc::new(CuratedOnly { curated }),
            Arc::new(CanonicalResolver),
            Arc::new(NullSink),
        )
    }

    fn payload(status: ClaimStatus) -> ClaimPayload {
        let entry = ClaimLogEntry::new("0000-0001", "2020abc", status, None, Utc::now());
        ClaimPayload::from_entry(&entry)
    }

    #[tokio::test]
    async fn test_enriches_and_canonicalizes() {
        let ctx = context(Some(CuratedProfile {
            authorized: true,
            current_affiliation: None,
            name_variations: vec![],
        }))
        .await;

        let out = process(&ctx, payload(ClaimStatus::Claimed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.record_id, "2020ABC");
        assert!(out.record_verified);
        assert_eq!(out.account_id, Some(1));
        assert_eq!(out.facts.orcid_name, vec!["Stern, Daniel"]);
    }

    #[tokio::test]
    async fn test_verified_record_id_is_not_resolved_again() {
        let ctx = context(None).await;
        let mut p = payload(ClaimStatus::Claimed);
        p.record_verified = true;

        let out = process(&ctx, p).await.unwrap().unwrap();
        assert_eq!(out.record_id, "2020abc");
    }

    #[tokio::test]
    async fn test_terminal_status_is_dropped() {
        let ctx = context(None).await;
        assert!(process(&ctx, payload(ClaimStatus::Unchanged))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_moderated_identity_is_dropped() {
        let ctx = context(None).await;
        // identity exists and is blacklisted before the claim arrives
        identities::insert(&ctx.pool, "0000-0001", None, &IdentityFacts::default())
            .await
            .unwrap();
        sqlx::query("UPDATE identities SET status = ? WHERE identity_id = ?")
            .bind(IdentityStatus::Blacklisted.as_str())
            .bind("0000-0001")
            .execute(&ctx.pool)
            .await
            .unwrap();

        let err = process(&ctx, payload(ClaimStatus::Claimed)).await.unwrap_err();
        assert!(err.is_ignorable());
    }

    #[tokio::test]
    async fn test_missing_ids_are_fatal() {
        let ctx = context(None).await;
        let mut p = payload(ClaimStatus::Claimed);
        p.record_id = String::new();
        let err = process(&ctx, p).await.unwrap_err();
        assert!(!err.is_ignorable() && !err.is_retryable());
    }
}
