//! Identity fact harvesting
//!
//! Builds the name-variant knowledge used by the position matcher. Facts
//! come from three places: the public profile (reported "Family, Given"
//! name), the bibliographic search API (how publishers actually spelled
//! this author), and the curated profile (authorization flag, affiliation,
//! hand-entered name variations). Abbreviated forms are generated from
//! the collected variants.

use crate::db::identities;
use crate::error::TaskResult;
use crate::models::{Identity, IdentityFacts};
use crate::names;
use crate::services::{MetadataSource, ProfileSource};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Harvester {
    profiles: Arc<dyn ProfileSource>,
    metadata: Arc<dyn MetadataSource>,
}

impl Harvester {
    pub fn new(profiles: Arc<dyn ProfileSource>, metadata: Arc<dyn MetadataSource>) -> Self {
        Self { profiles, metadata }
    }

    /// Collect everything the collaborating services know about an
    /// identity's names.
    pub async fn harvest_facts(&self, identity_id: &str) -> TaskResult<IdentityFacts> {
        let mut facts = IdentityFacts::default();

        if let Some(public) = self.profiles.public_profile(identity_id).await? {
            if let Some(reported) = reported_name(&public.family_name, &public.given_names) {
                facts.orcid_name.push(reported);
            }
        }

        // frequency count of publisher spellings at this identity's
        // author position
        let mut author_freq: BTreeMap<String, usize> = BTreeMap::new();
        let mut norm_variants: BTreeSet<String> = BTreeSet::new();
        for doc in self.metadata.works_for_identity(identity_id).await? {
            if let Some((author, norm)) = doc.names_for(identity_id) {
                if let Some(author) = author.filter(|a| !a.trim().is_empty()) {
                    *author_freq.entry(author.to_string()).or_insert(0) += 1;
                }
                if let Some(norm) = norm.filter(|n| !n.trim().is_empty()) {
                    norm_variants.insert(norm.to_string());
                }
            }
        }

        let mut author_variants: BTreeSet<String> = author_freq.keys().cloned().collect();

        if let Some(curated) = self.profiles.curated_profile(identity_id).await? {
            facts.authorized = curated.authorized;
            facts.current_affiliation = curated.current_affiliation;
            for variation in curated.name_variations {
                if !variation.trim().is_empty() {
                    author_variants.insert(variation);
                }
            }
        }

        // elect the most frequent publisher spelling as the display
        // name; ties resolve alphabetically via map order
        let mut elected: Option<(&String, usize)> = None;
        for (name, count) in &author_freq {
            if elected.map_or(true, |(_, best)| *count > best) {
                elected = Some((name, *count));
            }
        }
        facts.name = elected
            .map(|(name, _)| name.clone())
            .or_else(|| facts.orcid_name.first().cloned());

        let mut short: BTreeSet<String> = BTreeSet::new();
        for variant in author_variants
            .iter()
            .chain(facts.orcid_name.iter())
            .chain(norm_variants.iter())
        {
            short.extend(names::short_forms(variant));
        }

        facts.author = author_variants.into_iter().collect();
        facts.author_norm = norm_variants.into_iter().collect();
        facts.short_name = short.into_iter().collect();

        debug!(
            identity = %identity_id,
            variants = facts.author.len() + facts.author_norm.len()
                + facts.orcid_name.len() + facts.short_name.len(),
            "Harvested identity facts"
        );
        Ok(facts)
    }

    /// Fetch the identity row, creating it from freshly harvested facts
    /// on first sight and refreshing stored facts otherwise.
    pub async fn retrieve_identity(
        &self,
        pool: &SqlitePool,
        identity_id: &str,
    ) -> TaskResult<Identity> {
        let fresh = self.harvest_facts(identity_id).await?;

        match identities::get(pool, identity_id).await? {
            Some(existing) => Ok(identities::update_facts(pool, &existing, &fresh).await?),
            None => {
                info!(identity = %identity_id, "Creating identity");
                Ok(identities::insert(pool, identity_id, fresh.name.as_deref(), &fresh).await?)
            }
        }
    }
}

fn reported_name(family: &Option<String>, given: &Option<String>) -> Option<String> {
    let family = family.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    match given.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(given) => Some(format!("{}, {}", family, given)),
        None => Some(family.to_string()),
    }
}
