//! Device model: name-keyed maps of string properties with a `type` discriminator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};
use crate::types::is_true;

/// Kind of a device, taken from its `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    /// Network interface.
    Nic,
    /// Host path or storage volume mount.
    Disk,
    /// Character device node.
    UnixChar,
    /// Block device node.
    UnixBlock,
    /// USB device passthrough.
    Usb,
    /// GPU passthrough.
    Gpu,
    /// Socket forwarder between host and container.
    Proxy,
    /// Infiniband interface.
    Infiniband,
    /// Placeholder masking a profile device.
    None,
}

impl DeviceKind {
    /// Every kind, in the order handlers are consulted.
    pub const ALL: [Self; 9] = [
        Self::Nic,
        Self::Disk,
        Self::UnixChar,
        Self::UnixBlock,
        Self::Usb,
        Self::Gpu,
        Self::Proxy,
        Self::Infiniband,
        Self::None,
    ];

    /// Value of the `type` key for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nic => "nic",
            Self::Disk => "disk",
            Self::UnixChar => "unix-char",
            Self::UnixBlock => "unix-block",
            Self::Usb => "usb",
            Self::Gpu => "gpu",
            Self::Proxy => "proxy",
            Self::Infiniband => "infiniband",
            Self::None => "none",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CorralError::validation(format!("invalid device type: {s:?}")))
    }
}

/// A single device: an unordered mapping of string keys to values.
///
/// Two devices are equal when their full key/value sets are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(BTreeMap<String, String>);

impl Device {
    /// Creates an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a device from key/value pairs.
    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// Returns the value of `key`, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the value of `key`, or the empty string.
    #[must_use]
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or_default()
    }

    /// Whether `key` holds a true boolean spelling.
    #[must_use]
    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_true)
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Iterates over the key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses the `type` key.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `type` is missing or unknown.
    pub fn kind(&self) -> Result<DeviceKind> {
        match self.get("type") {
            Some(t) => t.parse(),
            None => Err(CorralError::validation("missing device type")),
        }
    }

    /// Whether this is a root disk: a disk mounted at `/`.
    #[must_use]
    pub fn is_root_disk(&self) -> bool {
        self.get("type") == Some("disk") && self.get("path") == Some("/")
    }

    /// Keys whose value differs between `self` and `other`, including keys set on one side only.
    #[must_use]
    pub fn differing_keys(&self, other: &Self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .0
            .iter()
            .filter(|(k, v)| other.0.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        for k in other.0.keys() {
            if !self.0.contains_key(k) {
                keys.push(k.clone());
            }
        }
        keys.sort();
        keys
    }
}

impl FromIterator<(String, String)> for Device {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A name-keyed set of devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Devices(BTreeMap<String, Device>);

impl Devices {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the device called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.0.get(name)
    }

    /// Returns a mutable reference to the device called `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.0.get_mut(name)
    }

    /// Inserts or replaces a device, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, device: Device) -> Option<Device> {
        self.0.insert(name.into(), device)
    }

    /// Removes a device.
    pub fn remove(&mut self, name: &str) -> Option<Device> {
        self.0.remove(name)
    }

    /// Whether the set holds a device with this exact name and content.
    #[must_use]
    pub fn contains(&self, name: &str, device: &Device) -> bool {
        self.0.get(name) == Some(device)
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Device names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Iterates over devices in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Device)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Devices of one kind, in name order. Devices with a bad `type` are skipped.
    pub fn of_kind(&self, kind: DeviceKind) -> impl Iterator<Item = (&str, &Device)> {
        self.iter()
            .filter(move |(_, d)| d.kind().is_ok_and(|k| k == kind))
    }

    /// Returns the single root disk device.
    ///
    /// # Errors
    ///
    /// Returns a validation error when there is no root disk or more than one.
    pub fn root_disk(&self) -> Result<(&str, &Device)> {
        let mut roots = self.iter().filter(|(_, d)| d.is_root_disk());
        let first = roots.next().ok_or_else(|| {
            CorralError::validation(
                "containers must have a root disk device (directly or inherited)",
            )
        })?;
        if roots.next().is_some() {
            return Err(CorralError::validation(
                "containers may only have one root disk device",
            ));
        }
        Ok(first)
    }
}

impl FromIterator<(String, Device)> for Devices {
    fn from_iter<T: IntoIterator<Item = (String, Device)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Devices {
    type Item = (String, Device);
    type IntoIter = std::collections::btree_map::IntoIter<String, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Device {
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default")])
    }

    #[test]
    fn kind_parses_all_types() {
        for kind in DeviceKind::ALL {
            let dev = Device::from_pairs([("type", kind.as_str())]);
            assert_eq!(dev.kind().unwrap(), kind);
        }
        assert!(Device::from_pairs([("type", "floppy")]).kind().is_err());
        assert!(Device::new().kind().is_err());
    }

    #[test]
    fn differing_keys_covers_both_sides() {
        let a = Device::from_pairs([("type", "nic"), ("limits.max", "10Mbit"), ("name", "eth0")]);
        let b = Device::from_pairs([("type", "nic"), ("limits.max", "20Mbit"), ("mtu", "1500")]);
        assert_eq!(a.differing_keys(&b), vec!["limits.max", "mtu", "name"]);
        assert!(a.differing_keys(&a).is_empty());
    }

    #[test]
    fn root_disk_requires_exactly_one() {
        let mut devices = Devices::new();
        assert!(devices.root_disk().is_err());

        let _ = devices.insert("root", root());
        assert_eq!(devices.root_disk().unwrap().0, "root");

        let _ = devices.insert("root2", root());
        let err = devices.root_disk().unwrap_err();
        assert!(err.to_string().contains("only have one root disk"));
    }

    #[test]
    fn devices_serialize_as_plain_maps() {
        let mut devices = Devices::new();
        let _ = devices.insert("root", root());
        let json = serde_json::to_string(&devices).unwrap();
        assert_eq!(
            json,
            r#"{"root":{"path":"/","pool":"default","type":"disk"}}"#
        );
    }
}
