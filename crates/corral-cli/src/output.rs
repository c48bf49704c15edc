//! Formatted output helpers for CLI commands.

use corral_common::device::Device;
use corral_common::types::StatusCode;
use corral_core::idmap::IdmapSet;

const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Colored state label for tables.
#[must_use]
pub fn state_label(state: StatusCode) -> String {
    let color = match state {
        StatusCode::Running => GREEN,
        StatusCode::Frozen => CYAN,
        StatusCode::Error => RED,
        _ => "",
    };
    if color.is_empty() {
        state.to_string()
    } else {
        format!("{color}{state}{RESET}")
    }
}

/// One-line rendering of a device's keys.
#[must_use]
pub fn device_summary(device: &Device) -> String {
    device
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One-line rendering of an id map, `privileged` when there is none.
#[must_use]
pub fn idmap_summary(set: Option<&IdmapSet>) -> String {
    let Some(set) = set else {
        return "privileged".into();
    };
    set.entries()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idmap_summary_lists_every_block() {
        let set = IdmapSet::contiguous(1_000_000, 65_536);
        assert_eq!(idmap_summary(Some(&set)), "u:0:1000000:65536 g:0:1000000:65536");
    }

    #[test]
    fn missing_idmap_means_privileged() {
        assert_eq!(idmap_summary(None), "privileged");
    }

    #[test]
    fn stopped_state_is_plain() {
        assert_eq!(state_label(StatusCode::Stopped), StatusCode::Stopped.to_string());
    }

    #[test]
    fn device_summary_joins_pairs() {
        let device = Device::from_pairs([("type", "nic"), ("parent", "br0")]);
        assert_eq!(device_summary(&device), "parent=br0 type=nic");
    }
}
