//! Bulk claim import
//!
//! Reads tab-delimited claim files: one claim per line,
//! `record_id<TAB>identity_id[<TAB>provenance[<TAB>status[<TAB>date]]]`.
//! Blank lines and `#` comments are skipped; malformed lines are logged
//! and skipped without aborting the batch. Missing fields default to the
//! file path as provenance, `claimed` as status, and the current time.

use crate::db::claims;
use crate::models::{ClaimLogEntry, ClaimStatus};
use claimtrail_common::{time, Result};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

/// Parse one import line. `None` means the line carries no claim.
fn parse_line(line: &str, line_no: usize, default_provenance: &str) -> Option<ClaimLogEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    if fields.len() < 2 || fields[0].is_empty() || fields[1].is_empty() {
        warn!(line_no, "Skipping malformed import line");
        return None;
    }

    let provenance = fields
        .get(2)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| default_provenance.to_string());

    let status = match fields.get(3).filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<ClaimStatus>() {
            Ok(status) => status,
            Err(_) => {
                warn!(line_no, status = %raw, "Skipping line with unknown status");
                return None;
            }
        },
        None => ClaimStatus::Claimed,
    };

    let created = match fields.get(4).filter(|s| !s.is_empty()) {
        Some(raw) => match time::parse_rfc3339(raw).or_else(|| time::parse_epoch_decimal(raw)) {
            Some(ts) => ts,
            None => {
                warn!(line_no, date = %raw, "Skipping line with unparseable date");
                return None;
            }
        },
        None => time::now(),
    };

    Some(ClaimLogEntry::new(
        fields[1],
        fields[0],
        status,
        Some(provenance),
        created,
    ))
}

/// Import a claim file, appending every well-formed line to the claim
/// log in one batch. Returns the stored entries.
pub async fn import_file(pool: &SqlitePool, path: &Path) -> Result<Vec<ClaimLogEntry>> {
    let content = std::fs::read_to_string(path)?;
    let provenance = path.display().to_string();

    let entries: Vec<ClaimLogEntry> = content
        .lines()
        .enumerate()
        .filter_map(|(i, line)| parse_line(line, i + 1, &provenance))
        .collect();

    let stored = claims::insert_claims(pool, &entries).await?;
    info!(
        file = %path.display(),
        imported = stored.len(),
        "Imported claims"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimtrail_common::db::init_memory_pool;
    use std::io::Write;

    #[test]
    fn test_parse_full_line() {
        let entry = parse_line(
            "2020A\t0000-0001\tcurators\tupdated\t2020-05-01T12:00:00Z",
            1,
            "file.tsv",
        )
        .unwrap();
        assert_eq!(entry.identity_id, "0000-0001");
        assert_eq!(entry.record_id, "2020A");
        assert_eq!(entry.provenance.as_deref(), Some("curators"));
        assert_eq!(entry.status, ClaimStatus::Updated);
        assert_eq!(time::format_rfc3339(entry.created), "2020-05-01T12:00:00.000000Z");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let entry = parse_line("2020A\t0000-0001", 1, "claims.tsv").unwrap();
        assert_eq!(entry.provenance.as_deref(), Some("claims.tsv"));
        assert_eq!(entry.status, ClaimStatus::Claimed);
    }

    #[test]
    fn test_comments_blanks_and_garbage_are_skipped() {
        assert!(parse_line("", 1, "f").is_none());
        assert!(parse_line("# header", 2, "f").is_none());
        assert!(parse_line("only-one-field", 3, "f").is_none());
        assert!(parse_line("2020A\t0000-0001\t\tdeleted", 4, "f").is_none());
        assert!(parse_line("2020A\t0000-0001\t\tclaimed\tyesterday", 5, "f").is_none());
    }

    #[test]
    fn test_epoch_decimal_dates_accepted() {
        let entry = parse_line("2020A\t0000-0001\t\t\t1437080261.216", 1, "f").unwrap();
        assert_eq!(time::format_rfc3339(entry.created), "2015-07-16T20:57:41.216000Z");
    }

    #[tokio::test]
    async fn test_import_file_batch() {
        let pool = init_memory_pool().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.tsv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# bulk load").unwrap();
        writeln!(file, "2020A\t0000-0001").unwrap();
        writeln!(file, "broken line").unwrap();
        writeln!(file, "2020B\t0000-0002\tcurators\tremoved").unwrap();
        drop(file);

        let stored = import_file(&pool, &path).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|e| e.id.is_some()));
        assert_eq!(stored[1].status, ClaimStatus::Removed);
        assert_eq!(
            stored[0].provenance.as_deref(),
            Some(path.display().to_string().as_str())
        );
    }
}
