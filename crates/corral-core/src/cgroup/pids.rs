//! Process count limit: `pids.max`.

use corral_common::error::{CorralError, Result};

use super::CgroupItem;

/// Item for `limits.processes`; an empty value lifts the limit.
///
/// # Errors
///
/// Returns a validation error when the value is not a number.
pub fn pids_item(value: &str) -> Result<CgroupItem> {
    if value.is_empty() {
        return Ok(CgroupItem::new("pids.max", "max"));
    }
    let n: u64 = value
        .parse()
        .map_err(|_| CorralError::validation(format!("invalid limits.processes: {value:?}")))?;
    Ok(CgroupItem::new("pids.max", n.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_means_unlimited() {
        assert_eq!(pids_item("").unwrap().value, "max");
        assert_eq!(pids_item("200").unwrap().value, "200");
        assert!(pids_item("many").is_err());
    }
}
