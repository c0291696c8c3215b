//! Author-name normalization and abbreviation
//!
//! Spellings of the same author vary wildly across sources ("Stern, D.",
//! "Stern, Daniel", "stern, daniel"); everything that compares names runs
//! them through [`normalize`] first. [`short_forms`] generates the
//! abbreviated variants used as a last-resort matching tier.

use std::collections::BTreeSet;

/// Canonicalize a name for comparison: strip periods, collapse
/// whitespace. Never fails; empty input yields an empty string.
pub fn normalize(name: &str) -> String {
    let stripped = name.replace('.', "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonicalize an identity identifier for comparison across sources that
/// format them inconsistently (with/without separators, mixed case).
pub fn normalize_identifier(id: &str) -> String {
    id.replace('-', "").to_lowercase()
}

/// Generate every abbreviated form of a "Surname, Given Middle ..." name:
/// each single given/middle token truncated to its initial, plus the
/// progressively truncated all-initials forms.
///
/// Returns an empty set when there is no comma separator or only a single
/// one-letter given name (nothing useful to abbreviate).
pub fn short_forms(name: &str) -> BTreeSet<String> {
    let name = normalize(name);
    let mut ret = BTreeSet::new();

    let Some((surname, rest)) = name.split_once(',') else {
        return ret;
    };

    let parts: Vec<&str> = rest.split(' ').filter(|p| !p.is_empty()).collect();
    if parts.len() == 1 && parts[0].chars().count() == 1 {
        return ret;
    }

    // each multi-letter token reduced to its initial, one at a time
    for i in 0..parts.len() {
        if parts[i].chars().count() > 1 {
            let mut w_parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
            w_parts[i] = initial_of(parts[i]);
            ret.insert(format!("{}, {}", surname, w_parts.join(" ")));
        }
    }

    // all-initials form, progressively truncated from the right
    let mut initials: Vec<String> = parts.iter().map(|p| initial_of(p)).collect();
    while !initials.is_empty() {
        ret.insert(format!("{}, {}", surname, initials.join(" ")));
        initials.pop();
    }

    ret
}

fn initial_of(token: &str) -> String {
    token.chars().take(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_periods_and_whitespace() {
        assert_eq!(normalize("Stern,  D. "), "Stern, D");
        assert_eq!(normalize("  el Hadi,\tK.M. "), "el Hadi, KM");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("0000-0003-2686-9241"), "0000000326869241");
        assert_eq!(normalize_identifier("0000-0002-194X"), "00000002194x");
    }

    #[test]
    fn test_short_forms_three_given_names() {
        let forms = short_forms("Porceddu, Ignazio Enrico Pietro");
        let expected: BTreeSet<String> = [
            "Porceddu, Ignazio Enrico P",
            "Porceddu, I E",
            "Porceddu, I Enrico Pietro",
            "Porceddu, I",
            "Porceddu, Ignazio E Pietro",
            "Porceddu, I E P",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(forms, expected);
    }

    #[test]
    fn test_short_forms_nothing_to_abbreviate() {
        assert!(short_forms("Porceddu,").is_empty());
        assert!(short_forms("Porceddu, I").is_empty());
        assert!(short_forms("Porceddu").is_empty());
    }

    #[test]
    fn test_short_forms_single_full_given_name() {
        let forms = short_forms("Stern, Daniel");
        let expected: BTreeSet<String> =
            ["Stern, D"].iter().map(|s| s.to_string()).collect();
        assert_eq!(forms, expected);
    }

    #[test]
    fn test_short_forms_strips_periods_first() {
        // "K." normalizes to "K" before abbreviation
        let forms = short_forms("Zhang, W.");
        assert!(forms.is_empty());
    }
}
