//! Memory limits: `memory.max`, `memory.high` and `memory.swap.max`.

use std::path::Path;

use corral_common::error::{CorralError, Result};

use super::CgroupItem;
use crate::units::parse_byte_size;

/// Reads `MemTotal` from a meminfo file, in bytes.
///
/// # Errors
///
/// Returns an error if the file cannot be read or has no `MemTotal` line.
pub fn host_memory_total(meminfo: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(meminfo).map_err(|e| CorralError::Io {
        path: meminfo.to_path_buf(),
        source: e,
    })?;
    content
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            kib.checked_mul(1024)
        })
        .ok_or_else(|| CorralError::external("meminfo", "no MemTotal line"))
}

/// Parses `limits.memory`: an absolute size or a percentage of `host_total`.
///
/// # Errors
///
/// Returns a validation error for malformed values.
pub fn parse_memory_limit(value: &str, host_total: u64) -> Result<u64> {
    let value = value.trim();
    if let Some(percent) = value.strip_suffix('%') {
        let percent: u64 = percent
            .parse()
            .map_err(|_| CorralError::validation(format!("invalid memory limit: {value:?}")))?;
        return Ok(host_total / 100 * percent);
    }
    parse_byte_size(value)
}

/// Items for a memory limit.
///
/// A soft limit only throttles (`memory.high`); a hard limit caps usage
/// (`memory.max`). Swap is disabled with `memory.swap.max=0` when swap
/// accounting exists and `swap` is false.
#[must_use]
pub fn memory_items(limit: Option<u64>, soft: bool, swap: bool, swap_accounting: bool) -> Vec<CgroupItem> {
    let mut items = match (limit, soft) {
        (None, _) => vec![
            CgroupItem::new("memory.max", "max"),
            CgroupItem::new("memory.high", "max"),
        ],
        (Some(bytes), true) => vec![
            CgroupItem::new("memory.max", "max"),
            CgroupItem::new("memory.high", bytes.to_string()),
        ],
        (Some(bytes), false) => vec![
            CgroupItem::new("memory.high", "max"),
            CgroupItem::new("memory.max", bytes.to_string()),
        ],
    };
    if swap_accounting {
        let value = if swap { "max" } else { "0" };
        items.push(CgroupItem::new("memory.swap.max", value));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_limits_use_host_total() {
        assert_eq!(parse_memory_limit("50%", 8_000).unwrap(), 4_000);
        assert_eq!(parse_memory_limit("1GiB", 0).unwrap(), 1 << 30);
        assert!(parse_memory_limit("half%", 8_000).is_err());
    }

    #[test]
    fn hard_limit_sets_memory_max() {
        let items = memory_items(Some(1024), false, true, true);
        assert!(items.contains(&CgroupItem::new("memory.max", "1024")));
        assert!(items.contains(&CgroupItem::new("memory.swap.max", "max")));
    }

    #[test]
    fn soft_limit_sets_memory_high_and_disables_swap() {
        let items = memory_items(Some(1024), true, false, true);
        assert!(items.contains(&CgroupItem::new("memory.high", "1024")));
        assert!(items.contains(&CgroupItem::new("memory.max", "max")));
        assert!(items.contains(&CgroupItem::new("memory.swap.max", "0")));
    }

    #[test]
    fn no_swap_item_without_accounting() {
        let items = memory_items(None, false, false, false);
        assert!(items.iter().all(|i| i.key != "memory.swap.max"));
    }

    #[test]
    fn meminfo_total_is_parsed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meminfo");
        std::fs::write(&path, "MemTotal:       16000 kB\nMemFree: 1 kB\n").expect("write");
        assert_eq!(host_memory_total(&path).expect("total"), 16_000 * 1024);
    }
}
