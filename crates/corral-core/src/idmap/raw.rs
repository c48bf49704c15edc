//! Parser for the `raw.idmap` configuration key.
//!
//! Each non-empty line reads `{both|uid|gid} HOST NS`, where both ranges are
//! `start` or `start-end` (inclusive) and must be of equal size.

use corral_common::error::{CorralError, Result};

use super::{IdmapEntry, IdmapSet, MAX_ID};

fn parse_range(text: &str) -> Result<(i64, i64)> {
    let invalid = || CorralError::InvalidIdmap {
        message: format!("invalid raw.idmap range {text}"),
    };
    let mut parts = text.split('-');
    let start: i64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let end: i64 = match parts.next() {
        Some(end) => end.parse().map_err(|_| invalid())?,
        None => start,
    };
    if parts.next().is_some() || start < 0 || end < start || end > MAX_ID {
        return Err(invalid());
    }
    let size = end
        .checked_sub(start)
        .and_then(|n| n.checked_add(1))
        .ok_or_else(invalid)?;
    Ok((start, size))
}

/// Parses `raw.idmap` text into entries, merged with [`IdmapSet::add_safe`].
///
/// # Errors
///
/// Returns [`CorralError::InvalidIdmap`] for malformed lines, unknown kinds or
/// ranges of different sizes, and [`CorralError::HostIdIsSubId`] when lines
/// collide on host ids.
pub fn parse_raw_idmap(value: &str) -> Result<Vec<IdmapEntry>> {
    let mut set = IdmapSet::default();
    for line in value.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [kind, host, ns] = fields.as_slice() else {
            return Err(CorralError::InvalidIdmap {
                message: format!("invalid raw.idmap line {line}"),
            });
        };

        let (host_id, host_size) = parse_range(host)?;
        let (ns_id, ns_size) = parse_range(ns)?;
        if host_size != ns_size {
            return Err(CorralError::InvalidIdmap {
                message: format!("idmap ranges of different sizes {line}"),
            });
        }

        let entry = match *kind {
            "both" => IdmapEntry::both(host_id, ns_id, ns_size),
            "uid" => IdmapEntry::uid(host_id, ns_id, ns_size),
            "gid" => IdmapEntry::gid(host_id, ns_id, ns_size),
            _ => {
                return Err(CorralError::InvalidIdmap {
                    message: format!("invalid raw.idmap type {line}"),
                });
            }
        };
        set.add_safe(entry)?;
    }
    Ok(set.entries().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ids_and_ranges() {
        let entries = parse_raw_idmap("both 1000 1000\nuid 50-59 500-509\n").unwrap();
        assert_eq!(
            entries,
            vec![
                IdmapEntry::both(1000, 1000, 1),
                IdmapEntry::uid(50, 500, 10)
            ]
        );
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(parse_raw_idmap("").unwrap().is_empty());
        assert!(parse_raw_idmap("\n\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_mismatched_sizes() {
        let err = parse_raw_idmap("uid 1000-1001 0").unwrap_err();
        assert!(err.to_string().contains("different sizes"));
    }

    #[test]
    fn rejects_unknown_kind_and_bad_lines() {
        assert!(parse_raw_idmap("user 1 1").is_err());
        assert!(parse_raw_idmap("uid 1").is_err());
        assert!(parse_raw_idmap("uid 1-2-3 1").is_err());
        assert!(parse_raw_idmap("uid a 1").is_err());
    }

    #[test]
    fn rejects_ids_outside_the_id_space() {
        let huge = "uid 0-9223372036854775807 0-9223372036854775807";
        assert!(matches!(
            parse_raw_idmap(huge).unwrap_err(),
            CorralError::InvalidIdmap { .. }
        ));
        assert!(parse_raw_idmap("both 4294967296 0").is_err());
        assert!(parse_raw_idmap("both 4294967295 0").is_ok());
    }

    #[test]
    fn rejects_colliding_host_ids() {
        let err = parse_raw_idmap("uid 1000-1009 0-9\nuid 1005 100").unwrap_err();
        assert!(matches!(err, CorralError::HostIdIsSubId));
    }
}
