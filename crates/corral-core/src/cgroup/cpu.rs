//! CPU limits: `cpu.weight` and `cpu.max`.

use corral_common::error::{CorralError, Result};

use super::CgroupItem;

const DEFAULT_WEIGHT: u64 = 100;
const MAX_WEIGHT: u64 = 10_000;
const DEFAULT_PRIORITY: u64 = 10;

/// Parses `limits.cpu.allowance` and `limits.cpu.priority` into cgroup items.
///
/// `N%` is a soft share (weight `N`), `Xms/Yms` a hard quota of `X` per `Y`.
/// The priority (0 to 10) lowers the weight below the default of 10.
///
/// # Errors
///
/// Returns a validation error for malformed values.
pub fn cpu_items(allowance: &str, priority: &str) -> Result<Vec<CgroupItem>> {
    let invalid = |what: &str, v: &str| CorralError::validation(format!("invalid {what}: {v:?}"));

    let (mut weight, max) = if allowance.is_empty() {
        (DEFAULT_WEIGHT, "max".to_string())
    } else if let Some(percent) = allowance.strip_suffix('%') {
        let percent: u64 = percent
            .parse()
            .map_err(|_| invalid("limits.cpu.allowance", allowance))?;
        (percent.clamp(1, MAX_WEIGHT), "max".to_string())
    } else {
        let (quota, period) = allowance
            .split_once('/')
            .ok_or_else(|| invalid("limits.cpu.allowance", allowance))?;
        let to_us = |v: &str| -> Result<u64> {
            v.strip_suffix("ms")
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(|ms| ms * 1000)
                .ok_or_else(|| invalid("limits.cpu.allowance", allowance))
        };
        (DEFAULT_WEIGHT, format!("{} {}", to_us(quota)?, to_us(period)?))
    };

    let priority = if priority.is_empty() {
        DEFAULT_PRIORITY
    } else {
        let p: u64 = priority
            .parse()
            .map_err(|_| invalid("limits.cpu.priority", priority))?;
        if p > 10 {
            return Err(invalid("limits.cpu.priority", priority));
        }
        p
    };
    weight = weight.saturating_sub(DEFAULT_PRIORITY - priority).max(1);

    Ok(vec![
        CgroupItem::new("cpu.weight", weight.to_string()),
        CgroupItem::new("cpu.max", max),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_cpu_unrestricted() {
        let items = cpu_items("", "").unwrap();
        assert_eq!(
            items,
            vec![
                CgroupItem::new("cpu.weight", "100"),
                CgroupItem::new("cpu.max", "max")
            ]
        );
    }

    #[test]
    fn percentage_sets_weight() {
        let items = cpu_items("50%", "").unwrap();
        assert_eq!(items[0].value, "50");
    }

    #[test]
    fn quota_sets_cpu_max_in_microseconds() {
        let items = cpu_items("25ms/100ms", "").unwrap();
        assert_eq!(items[1].value, "25000 100000");
    }

    #[test]
    fn priority_lowers_weight() {
        let items = cpu_items("", "4").unwrap();
        assert_eq!(items[0].value, "94");
        assert!(cpu_items("", "11").is_err());
        assert!(cpu_items("25/100", "").is_err());
    }
}
