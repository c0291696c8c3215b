//! Claim matrix updater
//!
//! Each record carries two fixed-width arrays, `verified` and
//! `unverified`, one slot per author position. A slot holds either the
//! empty marker `"-"` or the identity id that claims that position.
//! Applying a claim always erases the identity's previous trace first, so
//! reprocessing the same claim is idempotent and at most one slot per
//! identity survives.

use crate::matcher;
use crate::models::{ClaimPayload, ClaimStatus, RecordProjection};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Marker for an unclaimed author position
pub const EMPTY_SLOT: &str = "-";

/// Which array a claim landed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimField {
    Verified,
    Unverified,
}

/// Result of applying one claim to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The identity id was written at `position` in `field`
    Placed { field: ClaimField, position: usize },
    /// The claim was understood as a retraction and the identity's trace
    /// was erased
    Removed,
    /// Nothing changed; the caller must not advance any checkpoint
    NoOp,
}

/// The verified/unverified claim arrays of one record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaimsMatrix {
    #[serde(default)]
    pub verified: Vec<String>,
    #[serde(default)]
    pub unverified: Vec<String>,
}

impl ClaimsMatrix {
    /// Pad with empty slots or truncate so both arrays match the author
    /// list length. Slots are never reordered.
    pub fn resize_to(&mut self, num_authors: usize) {
        self.verified.resize(num_authors, EMPTY_SLOT.to_string());
        self.unverified.resize(num_authors, EMPTY_SLOT.to_string());
    }

    /// Blank out every slot currently holding `identity_id`, in both
    /// arrays, regardless of position. Returns whether anything changed.
    pub fn erase_identity(&mut self, identity_id: &str) -> bool {
        let mut modified = false;
        for arr in [&mut self.verified, &mut self.unverified] {
            for slot in arr.iter_mut() {
                if slot == identity_id {
                    *slot = EMPTY_SLOT.to_string();
                    modified = true;
                }
            }
        }
        modified
    }
}

/// Apply one claim to a record's claim matrix.
///
/// Resolution consults the claim's name-variant lists in descending
/// priority (`author`, `orcid_name`, `author_norm`, `short_name`); the
/// first list that yields a position wins. A matched position beyond the
/// author-list bounds is logged and skipped, continuing to the next tier.
pub fn apply_claim(
    rec: &mut RecordProjection,
    claim: &ClaimPayload,
    min_ratio: f64,
) -> ApplyOutcome {
    let num_authors = rec.authors.len();
    rec.claims.resize_to(num_authors);

    // a claim always first erases its own previous trace
    let erased = rec.claims.erase_identity(&claim.identity_id);

    let field = if claim.account_id.is_some() {
        ClaimField::Verified
    } else {
        ClaimField::Unverified
    };

    let tiers: [(&str, &Vec<String>); 4] = [
        ("author", &claim.facts.author),
        ("orcid_name", &claim.facts.orcid_name),
        ("author_norm", &claim.facts.author_norm),
        ("short_name", &claim.facts.short_name),
    ];

    for (tier, variants) in tiers {
        if variants.is_empty() {
            continue;
        }
        let Some(idx) = matcher::match_position(&rec.authors, variants, min_ratio) else {
            continue;
        };
        if idx >= num_authors {
            error!(
                tier,
                position = idx,
                num_authors,
                record_id = %rec.record_id,
                "Matched position is beyond the author list"
            );
            continue;
        }

        let target = match field {
            ClaimField::Verified => &mut rec.claims.verified,
            ClaimField::Unverified => &mut rec.claims.unverified,
        };

        if claim.status == ClaimStatus::Removed {
            target[idx] = EMPTY_SLOT.to_string();
            debug!(
                record_id = %rec.record_id,
                identity = %claim.identity_id,
                position = idx,
                "Claim retracted at matched position"
            );
            return ApplyOutcome::Removed;
        }

        target[idx] = claim.identity_id.clone();
        return ApplyOutcome::Placed {
            field,
            position: idx,
        };
    }

    if erased {
        // no list matched, but the erase pass changed something: a pure
        // retraction
        return ApplyOutcome::Removed;
    }

    ApplyOutcome::NoOp
}
