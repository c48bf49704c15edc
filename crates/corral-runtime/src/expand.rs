//! Configuration expansion.
//!
//! A container's effective configuration is its profiles applied in order,
//! with the container's own keys and devices applied last.

use corral_common::device::Devices;
use corral_common::types::ConfigMap;
use serde::{Deserialize, Serialize};

/// A named, reusable set of configuration keys and devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Profile name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Configuration keys.
    pub config: ConfigMap,
    /// Devices.
    pub devices: Devices,
}

impl Profile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Merges profile configuration with local configuration. Later profiles
/// override earlier ones and local keys override every profile.
#[must_use]
pub fn expand_config(local: &ConfigMap, profiles: &[Profile]) -> ConfigMap {
    let mut expanded = ConfigMap::new();
    for profile in profiles {
        expanded.extend(profile.config.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    expanded.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
    expanded
}

/// Merges profile devices with local devices. Devices are replaced whole
/// by name, never merged key by key.
#[must_use]
pub fn expand_devices(local: &Devices, profiles: &[Profile]) -> Devices {
    let mut expanded = Devices::new();
    for profile in profiles {
        for (name, device) in profile.devices.iter() {
            let _ = expanded.insert(name, device.clone());
        }
    }
    for (name, device) in local.iter() {
        let _ = expanded.insert(name, device.clone());
    }
    expanded
}

#[cfg(test)]
mod tests {
    use corral_common::device::Device;

    use super::*;

    fn profile(name: &str, pairs: &[(&str, &str)]) -> Profile {
        let mut p = Profile::new(name);
        for (k, v) in pairs {
            let _ = p.config.insert((*k).to_string(), (*v).to_string());
        }
        p
    }

    #[test]
    fn later_profiles_and_local_keys_win() {
        let profiles = vec![
            profile("default", &[("limits.cpu", "1"), ("limits.memory", "1GB")]),
            profile("big", &[("limits.memory", "4GB")]),
        ];
        let mut local = ConfigMap::new();
        let _ = local.insert("limits.cpu".into(), "2".into());

        let expanded = expand_config(&local, &profiles);
        assert_eq!(expanded["limits.cpu"], "2");
        assert_eq!(expanded["limits.memory"], "4GB");
    }

    #[test]
    fn devices_are_replaced_whole() {
        let mut base = Profile::new("default");
        let _ = base.devices.insert(
            "eth0",
            Device::from_pairs([("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]),
        );
        let mut local = Devices::new();
        let _ = local.insert("eth0", Device::from_pairs([("type", "nic"), ("nictype", "p2p")]));

        let expanded = expand_devices(&local, &[base]);
        let eth0 = expanded.get("eth0").expect("eth0");
        assert_eq!(eth0.value("nictype"), "p2p");
        assert_eq!(eth0.get("parent"), None);
    }

    #[test]
    fn no_profiles_is_identity() {
        let mut local = ConfigMap::new();
        let _ = local.insert("security.nesting".into(), "true".into());
        assert_eq!(expand_config(&local, &[]), local);
    }
}
