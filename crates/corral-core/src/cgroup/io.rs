//! Block I/O limits: `io.weight` and `io.max`.

use corral_common::error::{CorralError, Result};

use super::CgroupItem;
use crate::units::parse_byte_size;

/// Weight for `limits.disk.priority` (0 to 10, default 5): `priority * 100`, with 0 mapped to 10.
///
/// # Errors
///
/// Returns a validation error for values outside 0 to 10.
pub fn disk_priority_weight(priority: &str) -> Result<u64> {
    let priority: u64 = if priority.is_empty() {
        5
    } else {
        priority
            .parse()
            .ok()
            .filter(|p| *p <= 10)
            .ok_or_else(|| {
                CorralError::validation(format!("invalid limits.disk.priority: {priority:?}"))
            })?
    };
    Ok(if priority == 0 { 10 } else { priority * 100 })
}

/// Item for `limits.disk.priority`.
///
/// # Errors
///
/// Returns a validation error for invalid priorities.
pub fn io_weight_item(priority: &str) -> Result<CgroupItem> {
    Ok(CgroupItem::new(
        "io.weight",
        disk_priority_weight(priority)?.to_string(),
    ))
}

/// A disk throughput limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLimit {
    /// Bytes per second.
    Bps(u64),
    /// Operations per second.
    Iops(u64),
}

impl DiskLimit {
    /// Parses `100iops` or a byte size per second such as `10MB`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed values.
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(iops) = value.trim().strip_suffix("iops") {
            return iops
                .parse()
                .map(Self::Iops)
                .map_err(|_| CorralError::validation(format!("invalid disk limit: {value:?}")));
        }
        parse_byte_size(value).map(Self::Bps)
    }
}

/// Read and write limits of one block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockLimits {
    /// Read limit.
    pub read: Option<DiskLimit>,
    /// Write limit.
    pub write: Option<DiskLimit>,
}

impl BlockLimits {
    /// Whether neither direction is limited.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// `io.max` line for a block device.
#[must_use]
pub fn io_max_line(major: u32, minor: u32, limits: &BlockLimits) -> String {
    let field = |limit: Option<DiskLimit>, want_iops: bool| match (limit, want_iops) {
        (Some(DiskLimit::Bps(v)), false) | (Some(DiskLimit::Iops(v)), true) => v.to_string(),
        _ => "max".to_string(),
    };
    format!(
        "{major}:{minor} rbps={} wbps={} riops={} wiops={}",
        field(limits.read, false),
        field(limits.write, false),
        field(limits.read, true),
        field(limits.write, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_weights() {
        assert_eq!(disk_priority_weight("").unwrap(), 500);
        assert_eq!(disk_priority_weight("0").unwrap(), 10);
        assert_eq!(disk_priority_weight("10").unwrap(), 1000);
        assert!(disk_priority_weight("11").is_err());
    }

    #[test]
    fn disk_limits_parse_both_forms() {
        assert_eq!(DiskLimit::parse("100iops").unwrap(), DiskLimit::Iops(100));
        assert_eq!(DiskLimit::parse("10MB").unwrap(), DiskLimit::Bps(10_000_000));
        assert!(DiskLimit::parse("fastiops").is_err());
    }

    #[test]
    fn io_max_fills_unlimited_fields() {
        let limits = BlockLimits {
            read: Some(DiskLimit::Bps(1000)),
            write: Some(DiskLimit::Iops(20)),
        };
        assert_eq!(
            io_max_line(8, 0, &limits),
            "8:0 rbps=1000 wbps=max riops=max wiops=20"
        );
    }
}
