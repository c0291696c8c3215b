//! Fuzzy author-position matcher
//!
//! Given a record's canonical author list and the name variants known for
//! one identity, finds the author position the identity most plausibly
//! occupies. Similarity is a symmetric edit-distance ratio in [0, 1]
//! (`strsim::normalized_levenshtein`); the acceptance threshold is
//! caller-supplied configuration, never hard-coded here.

use crate::names;
use strsim::normalized_levenshtein;
use tracing::debug;

/// Find the best-matching author position for a set of name variants.
///
/// All inputs are normalized and lowercased before comparison. The
/// globally highest-scoring (author, variant) pair wins if its ratio
/// reaches `min_ratio`; below the threshold a literal-substring fallback
/// accepts truncated forms ("vernetto, s" vs "vernetto, silvia teresa").
///
/// Ties resolve to the first pair in (variant, author) iteration order;
/// callers must not read meaning into which tied position wins.
pub fn match_position(authors: &[String], name_variants: &[String], min_ratio: f64) -> Option<usize> {
    let al: Vec<String> = authors
        .iter()
        .map(|a| names::normalize(a).to_lowercase())
        .collect();
    let nv: Vec<String> = name_variants
        .iter()
        .map(|v| names::normalize(v).to_lowercase())
        .collect();

    // exhaustive scoring; author lists and variant sets are both small
    let mut best: Option<(f64, usize, usize)> = None;
    for (vidx, variant) in nv.iter().enumerate() {
        for (aidx, author) in al.iter().enumerate() {
            let ratio = normalized_levenshtein(author, variant);
            if best.map_or(true, |(b, _, _)| ratio > b) {
                best = Some((ratio, aidx, vidx));
            }
        }
    }

    let (ratio, aidx, vidx) = best?;

    if ratio < min_ratio {
        let author_name = &al[aidx];
        let variant_name = &nv[vidx];
        if author_name.contains(variant_name.as_str())
            || variant_name.contains(author_name.as_str())
        {
            debug!(
                ratio,
                required = min_ratio,
                author = %author_name,
                variant = %variant_name,
                "Using submatch"
            );
            return Some(aidx);
        }

        debug!(
            ratio,
            required = min_ratio,
            author = %author_name,
            variant = %variant_name,
            "No match found"
        );
        return None;
    }

    Some(aidx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matches_stern_at_position_12() {
        let authors = strings(&[
            "Barrière, N.",
            "Krivonos, R.",
            "Tomsick, J.",
            "Bachetti, M.",
            "Boggs, S.",
            "Chakrabarty, D.",
            "Christensen, F.",
            "Craig, W.",
            "Hailey, C.",
            "Harrison, F.",
            "Hong, J.",
            "Mori, K.",
            "Stern, Daniel",
            "Zhang, W.",
        ]);
        let variants = strings(&["Stern, D.", "Stern, Daniel"]);
        assert_eq!(match_position(&authors, &variants, 0.69), Some(12));
    }

    #[test]
    fn test_no_match_for_unrelated_names() {
        let authors = strings(&["Erdmann, Christopher", "Frey, Katie"]);
        let variants = strings(&["Accomazzi, Alberto"]);
        assert_eq!(match_position(&authors, &variants, 0.69), None);
    }

    #[test]
    fn test_submatch_fallback_accepts_truncated_variant() {
        let authors = strings(&["Vernetto, S."]);
        let variants = strings(&["Vernetto, Silvia Teresa"]);
        // ratio is well below threshold, but the normalized author is a
        // literal prefix of the variant
        assert_eq!(match_position(&authors, &variants, 0.9), Some(0));
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(match_position(&[], &strings(&["Stern, D."]), 0.69), None);
        assert_eq!(match_position(&strings(&["Stern, D."]), &[], 0.69), None);
    }

    #[test]
    fn test_threshold_is_respected() {
        let authors = strings(&["Neumann, John"]);
        let variants = strings(&["Neuman, J"]);
        // similar but not identical; generous threshold accepts,
        // strict threshold falls through to submatch (which fails here)
        assert_eq!(match_position(&authors, &variants, 0.6), Some(0));
        assert_eq!(match_position(&authors, &variants, 0.95), None);
    }

    #[test]
    fn test_tie_is_deterministic() {
        let authors = strings(&["Smith, J.", "Smith, J."]);
        let variants = strings(&["Smith, J."]);
        // duplicate authors tie at 1.0; first index wins
        assert_eq!(match_position(&authors, &variants, 0.69), Some(0));
    }
}
