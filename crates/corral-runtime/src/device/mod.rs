//! Device reconciliation.
//!
//! A container's expanded device map is compared against the previous one
//! to decide which devices to detach, attach or update in place. Each
//! device kind is handled by a [`DeviceHandler`]; handlers either return
//! runtime configuration items (at boot) or act on the running container
//! through its runtime handle (live).

pub mod disk;
pub mod hotplug;
pub mod nic;
pub mod passthrough;
pub mod proxy;
pub mod unix;

use std::path::{Path, PathBuf};

use corral_common::config::DriverConfig;
use corral_common::device::{Device, DeviceKind, Devices};
use corral_common::error::{CorralError, Result};
use corral_common::types::ConfigMap;
use corral_core::idmap::IdmapSet;

use crate::backend::{RuntimeHandle, RuntimeLibrary};
use crate::network::NetworkPlumbing;
use crate::storage::StorageDriver;

/// Keys whose change can be applied to a running device without
/// recreating it.
pub const LIVE_UPDATE_KEYS: [&str; 9] = [
    "limits.max",
    "limits.read",
    "limits.write",
    "limits.egress",
    "limits.ingress",
    "ipv4.address",
    "ipv6.address",
    "ipv4.routes",
    "ipv6.routes",
];

/// Result of comparing two device maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Devices to detach.
    pub removed: Devices,
    /// Devices to attach.
    pub added: Devices,
    /// Devices changed only in live keys, holding their new definition.
    pub updated: Devices,
    /// Keys that differ across the updated devices.
    pub changed_keys: Vec<String>,
}

impl DeviceDiff {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.updated.is_empty()
    }
}

const fn supports_live_update(kind: DeviceKind) -> bool {
    matches!(kind, DeviceKind::Nic | DeviceKind::Infiniband | DeviceKind::Disk)
}

/// Compares `old` and `new`.
///
/// A device whose definition is unchanged is left alone. A device whose
/// differences all fall within [`LIVE_UPDATE_KEYS`] (for kinds that
/// support it) is `updated`; any other difference is a removal plus an
/// addition.
#[must_use]
pub fn diff(old: &Devices, new: &Devices) -> DeviceDiff {
    let mut result = DeviceDiff::default();
    for (name, device) in old.iter() {
        if !new.contains(name, device) {
            let _ = result.removed.insert(name, device.clone());
        }
    }
    for (name, device) in new.iter() {
        if !old.contains(name, device) {
            let _ = result.added.insert(name, device.clone());
        }
    }

    let candidates: Vec<String> = result
        .added
        .names()
        .into_iter()
        .filter(|name| result.removed.get(name).is_some())
        .map(str::to_string)
        .collect();
    for name in candidates {
        let (Some(before), Some(after)) = (result.removed.get(&name), result.added.get(&name)) else {
            continue;
        };
        let same_kind = before.get("type") == after.get("type");
        let live = before.kind().is_ok_and(supports_live_update);
        let keys = before.differing_keys(after);
        if !(same_kind && live && keys.iter().all(|k| LIVE_UPDATE_KEYS.contains(&k.as_str()))) {
            continue;
        }
        for key in keys {
            if !result.changed_keys.contains(&key) {
                result.changed_keys.push(key);
            }
        }
        let _ = result.removed.remove(&name);
        if let Some(device) = result.added.remove(&name) {
            let _ = result.updated.insert(name, device);
        }
    }
    result.changed_keys.sort();
    result
}

/// Devices in the order they must be attached: every non-disk device by
/// name, then disks by mount path so parents are mounted before children.
#[must_use]
pub fn attach_order(devices: &Devices) -> Vec<(&str, &Device)> {
    let mut ordered: Vec<(&str, &Device)> = devices.iter().collect();
    ordered.sort_by(|(a_name, a), (b_name, b)| {
        let a_disk = a.get("type") == Some("disk");
        let b_disk = b.get("type") == Some("disk");
        let a_path = if a_disk { a.value("path") } else { "" };
        let b_path = if b_disk { b.value("path") } else { "" };
        (a_disk, a_path, *a_name).cmp(&(b_disk, b_path, *b_name))
    });
    ordered
}

/// Devices in the order they must be detached: the reverse of
/// [`attach_order`].
#[must_use]
pub fn detach_order(devices: &Devices) -> Vec<(&str, &Device)> {
    let mut ordered = attach_order(devices);
    ordered.reverse();
    ordered
}

/// Name of the file backing a device in the container's devices
/// directory: `<prefix>.<device>.<path>` with slashes escaped.
#[must_use]
pub fn device_file_name(prefix: &str, device: &str, path: &str) -> String {
    format!(
        "{prefix}.{}.{}",
        device.replace('/', "-"),
        path.trim_start_matches('/').replace('/', "-")
    )
}

/// When a device is being realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// While generating the runtime configuration of a starting container.
    Boot,
    /// On the running container.
    Live,
}

/// Everything a handler may touch while acting on one container.
#[derive(Clone, Copy)]
pub struct DeviceContext<'a> {
    /// Container name.
    pub container: &'a str,
    /// Host directory holding the container's device files.
    pub devices_dir: &'a Path,
    /// Expanded configuration, including volatile keys.
    pub config: &'a ConfigMap,
    /// Expanded devices.
    pub devices: &'a Devices,
    /// Idmap the container runs with, `None` when privileged.
    pub idmap: Option<&'a IdmapSet>,
    /// Runtime handle; required for live changes.
    pub handle: Option<&'a dyn RuntimeHandle>,
    /// Runtime library the handle came from.
    pub runtime: &'a dyn RuntimeLibrary,
    /// Host configuration.
    pub driver: &'a DriverConfig,
    /// Storage driver holding the container's volumes.
    pub storage: &'a dyn StorageDriver,
    /// Host network plumbing.
    pub network: &'a dyn NetworkPlumbing,
}

impl<'a> DeviceContext<'a> {
    /// The runtime handle, or an error when the container has none.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when no handle is attached.
    pub fn live_handle(&self) -> Result<&'a dyn RuntimeHandle> {
        self.handle
            .ok_or_else(|| CorralError::invalid_state("the container is not running"))
    }

    /// Host uid/gid of a namespace uid/gid under the container's idmap.
    #[must_use]
    pub fn host_owner(&self, uid: u32, gid: u32) -> (u32, u32) {
        let Some(map) = self.idmap else {
            return (uid, gid);
        };
        map.ns_to_host(i64::from(uid), i64::from(gid))
            .and_then(|(u, g)| Some((u32::try_from(u).ok()?, u32::try_from(g).ok()?)))
            .unwrap_or((uid, gid))
    }

    /// Value of `volatile.<device>.<suffix>`, empty when unset.
    #[must_use]
    pub fn volatile(&self, device: &str, suffix: &str) -> &'a str {
        self.config
            .get(&corral_common::constants::keys::volatile_device(device, suffix))
            .map_or("", String::as_str)
    }

    /// Path of a file in the devices directory.
    #[must_use]
    pub fn device_path(&self, prefix: &str, device: &str, path: &str) -> PathBuf {
        self.devices_dir.join(device_file_name(prefix, device, path))
    }

    /// Creates the devices directory when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_devices_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.devices_dir).map_err(|e| CorralError::Io {
            path: self.devices_dir.to_path_buf(),
            source: e,
        })
    }
}

/// Side effects a handler asks the container to record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOutcome {
    /// Runtime configuration items, at boot.
    pub config_items: Vec<(String, String)>,
    /// Volatile keys to set (`Some`) or remove (`None`).
    pub volatile: Vec<(String, Option<String>)>,
    /// Missing optional sources to watch: `(device, path)`.
    pub watches: Vec<(String, PathBuf)>,
}

impl DeviceOutcome {
    /// Appends a runtime configuration item.
    pub fn item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config_items.push((key.into(), value.into()));
    }

    /// Records a volatile key change.
    pub fn set_volatile(&mut self, device: &str, suffix: &str, value: Option<String>) {
        self.volatile.push((
            corral_common::constants::keys::volatile_device(device, suffix),
            value,
        ));
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.config_items.extend(other.config_items);
        self.volatile.extend(other.volatile);
        self.watches.extend(other.watches);
    }
}

/// Attach, detach and update behaviour of one device kind.
pub trait DeviceHandler: Send + Sync {
    /// Realizes `device` at boot (as configuration items) or live.
    ///
    /// # Errors
    ///
    /// Returns an error when a required resource is missing or the host
    /// refuses the change.
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome>;

    /// Removes `device` from the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be taken away.
    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<DeviceOutcome>;

    /// Applies a change limited to live keys. Kinds without live keys keep
    /// the default no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the new values cannot be applied.
    fn update(
        &self,
        _ctx: &DeviceContext<'_>,
        _name: &str,
        _old: &Device,
        _new: &Device,
        _changed: &[String],
    ) -> Result<DeviceOutcome> {
        Ok(DeviceOutcome::default())
    }

    /// Releases host-side state after the container stopped. Failures are
    /// logged, not returned.
    fn cleanup(&self, _ctx: &DeviceContext<'_>, _name: &str, _device: &Device) -> DeviceOutcome {
        DeviceOutcome::default()
    }
}

/// Handler of `none` devices, which only mask inherited devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneHandler;

impl DeviceHandler for NoneHandler {
    fn attach(&self, _ctx: &DeviceContext<'_>, _name: &str, _device: &Device, _phase: Phase) -> Result<DeviceOutcome> {
        Ok(DeviceOutcome::default())
    }

    fn detach(&self, _ctx: &DeviceContext<'_>, _name: &str, _device: &Device) -> Result<DeviceOutcome> {
        Ok(DeviceOutcome::default())
    }
}

/// The handler of a device kind.
#[must_use]
pub fn handler_for(kind: DeviceKind) -> &'static dyn DeviceHandler {
    match kind {
        DeviceKind::Nic | DeviceKind::Infiniband => &nic::NicHandler,
        DeviceKind::Disk => &disk::DiskHandler,
        DeviceKind::UnixChar | DeviceKind::UnixBlock => &unix::UnixHandler,
        DeviceKind::Usb => &passthrough::UsbHandler,
        DeviceKind::Gpu => &passthrough::GpuHandler,
        DeviceKind::Proxy => &proxy::ProxyHandler,
        DeviceKind::None => &NoneHandler,
    }
}

/// Attaches every device of `devices` in [`attach_order`].
///
/// # Errors
///
/// Stops at the first device whose handler fails, naming it.
pub fn attach_all(ctx: &DeviceContext<'_>, devices: &Devices, phase: Phase) -> Result<DeviceOutcome> {
    let mut outcome = DeviceOutcome::default();
    for (name, device) in attach_order(devices) {
        if device.is_root_disk() && phase == Phase::Live {
            continue;
        }
        let kind = device.kind()?;
        if phase == Phase::Boot && kind == DeviceKind::Proxy {
            continue;
        }
        let result = handler_for(kind)
            .attach(ctx, name, device, phase)
            .map_err(|e| device_error("attach", name, &e))?;
        outcome.merge(result);
    }
    Ok(outcome)
}

/// Applies `diff` to the running container: removals first, then
/// additions, then in-place updates.
///
/// # Errors
///
/// Stops at the first failing device. Changes already applied are kept.
pub fn reconcile_live(ctx: &DeviceContext<'_>, old: &Devices, diff: &DeviceDiff) -> Result<DeviceOutcome> {
    let mut outcome = DeviceOutcome::default();
    for (name, device) in detach_order(&diff.removed) {
        if device.is_root_disk() {
            continue;
        }
        tracing::debug!(container = ctx.container, device = name, "detaching device");
        let result = handler_for(device.kind()?)
            .detach(ctx, name, device)
            .map_err(|e| device_error("detach", name, &e))?;
        outcome.merge(result);
    }
    outcome.merge(attach_all(ctx, &diff.added, Phase::Live)?);
    for (name, device) in diff.updated.iter() {
        let Some(before) = old.get(name) else {
            continue;
        };
        tracing::debug!(container = ctx.container, device = name, "updating device");
        let result = handler_for(device.kind()?)
            .update(ctx, name, before, device, &diff.changed_keys)
            .map_err(|e| device_error("update", name, &e))?;
        outcome.merge(result);
    }
    Ok(outcome)
}

/// Runs every handler's post-stop cleanup.
pub fn cleanup_all(ctx: &DeviceContext<'_>, devices: &Devices) -> DeviceOutcome {
    let mut outcome = DeviceOutcome::default();
    for (name, device) in detach_order(devices) {
        if let Ok(kind) = device.kind() {
            outcome.merge(handler_for(kind).cleanup(ctx, name, device));
        }
    }
    outcome
}

fn device_error(action: &str, name: &str, err: &CorralError) -> CorralError {
    match err {
        CorralError::Validation { .. } | CorralError::NotFound { .. } => {
            CorralError::validation(format!("failed to {action} device {name}: {err}"))
        }
        _ => CorralError::external(format!("failed to {action} device {name}"), err),
    }
}

/// Removes leftover device files whose name starts with `prefix.`.
///
/// Disk mount points are detached first. Returns how many entries were
/// removed.
pub fn remove_leftovers(devices_dir: &Path, prefix: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(devices_dir) else {
        return 0;
    };
    let wanted = format!("{prefix}.");
    let mut removed = 0;
    for entry in entries.filter_map(std::result::Result::ok) {
        if !entry.file_name().to_string_lossy().starts_with(&wanted) {
            continue;
        }
        let path = entry.path();
        if prefix == "disk" {
            if let Err(e) = corral_core::filesystem::mount::unmount_detach(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to unmount device leftover");
            }
        }
        let result = if path.is_dir() {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove device leftover"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(limit: &str, host_name: &str) -> Device {
        Device::from_pairs([
            ("type", "nic"),
            ("nictype", "bridged"),
            ("parent", "br0"),
            ("limits.max", limit),
            ("host_name", host_name),
        ])
    }

    fn disk(path: &str) -> Device {
        Device::from_pairs([("type", "disk"), ("path", path), ("source", "/srv")])
    }

    fn devices(pairs: Vec<(&str, Device)>) -> Devices {
        pairs.into_iter().map(|(n, d)| (n.to_string(), d)).collect()
    }

    #[test]
    fn identical_maps_have_no_changes() {
        let set = devices(vec![("eth0", nic("10Mbit", "veth1")), ("data", disk("/data"))]);
        let d = diff(&set, &set);
        assert!(d.is_empty());
        assert!(d.changed_keys.is_empty());
    }

    #[test]
    fn live_key_changes_are_updates() {
        let old = devices(vec![("eth0", nic("10Mbit", "veth1"))]);
        let new = devices(vec![("eth0", nic("20Mbit", "veth1"))]);
        let d = diff(&old, &new);
        assert!(d.removed.is_empty() && d.added.is_empty());
        assert_eq!(d.updated.names(), vec!["eth0"]);
        assert_eq!(d.changed_keys, vec!["limits.max"]);
    }

    #[test]
    fn other_changes_recreate_the_device() {
        let old = devices(vec![("eth0", nic("10Mbit", "veth1"))]);
        let new = devices(vec![("eth0", nic("20Mbit", "veth2"))]);
        let d = diff(&old, &new);
        assert_eq!(d.removed.names(), vec!["eth0"]);
        assert_eq!(d.added.get("eth0").map(|x| x.value("host_name")), Some("veth2"));
        assert!(d.updated.is_empty());
    }

    #[test]
    fn proxies_never_update_in_place() {
        let proxy = |listen: &str| {
            Device::from_pairs([("type", "proxy"), ("listen", listen), ("connect", "tcp:127.0.0.1:80"), ("limits.max", "1")])
        };
        let old = devices(vec![("web", proxy("tcp:0.0.0.0:80"))]);
        let mut changed = proxy("tcp:0.0.0.0:80");
        let _ = changed.set("limits.max", "2");
        let d = diff(&old, &devices(vec![("web", changed)]));
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.added.len(), 1);
    }

    #[test]
    fn additions_and_removals_by_name() {
        let old = devices(vec![("a", disk("/a"))]);
        let new = devices(vec![("b", disk("/b"))]);
        let d = diff(&old, &new);
        assert_eq!(d.removed.names(), vec!["a"]);
        assert_eq!(d.added.names(), vec!["b"]);
    }

    #[test]
    fn disks_attach_parents_first() {
        let set = devices(vec![
            ("z-parent", disk("/mnt")),
            ("a-child", disk("/mnt/inner")),
            ("eth0", nic("", "")),
        ]);
        let order: Vec<&str> = attach_order(&set).into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["eth0", "z-parent", "a-child"]);
        let order: Vec<&str> = detach_order(&set).into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["a-child", "z-parent", "eth0"]);
    }

    #[test]
    fn device_files_escape_paths() {
        assert_eq!(device_file_name("unix", "fuse", "/dev/fuse"), "unix.fuse.dev-fuse");
        assert_eq!(device_file_name("disk", "a/b", "/mnt/data"), "disk.a-b.mnt-data");
    }

    #[test]
    fn leftovers_are_removed_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("unix.fuse.dev-fuse"), "").expect("write");
        std::fs::write(dir.path().join("proxy.web"), "1").expect("write");
        assert_eq!(remove_leftovers(dir.path(), "unix"), 1);
        assert!(dir.path().join("proxy.web").exists());
        assert_eq!(remove_leftovers(&dir.path().join("missing"), "unix"), 0);
    }
}
