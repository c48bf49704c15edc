//! Configuration and device updates.
//!
//! Updates do not take the operation lock, so they can run while a start
//! or stop is in flight. A failed update puts the in-memory state back;
//! host side effects applied before the failure are not undone.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use corral_common::constants::keys;
use corral_common::device::{DeviceKind, Devices};
use corral_common::error::{CorralError, Result};
use corral_common::types::ConfigMap;
use corral_core::cgroup::CgroupItem;
use corral_core::cgroup::cpu::cpu_items;
use corral_core::cgroup::io::io_weight_item;
use corral_core::cgroup::pids::pids_item;
use corral_core::kmod::load_modules;

use super::config::memory_limit_items;
use super::{Container, ContainerData};
use crate::backend::RuntimeHandle;
use crate::device::{DeviceDiff, diff, reconcile_live};
use crate::store::ContainerRecord;
use crate::validate::{merge_read_only, validate_config, validate_devices, validate_profiles};

const MEMORY_KEYS: [&str; 3] = [
    keys::LIMITS_MEMORY,
    keys::LIMITS_MEMORY_ENFORCE,
    keys::LIMITS_MEMORY_SWAP,
];

const NIC_VOLATILE_SUFFIXES: [&str; 3] = ["name", "hwaddr", "host_name"];

fn idmap_sensitive(key: &str) -> bool {
    key == keys::SECURITY_PRIVILEGED || key == keys::RAW_IDMAP || key.starts_with("security.idmap.")
}

/// Requested state of a container's editable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateArgs {
    /// Free-form description.
    pub description: String,
    /// Delete the container when it stops.
    pub ephemeral: bool,
    /// Profiles applied in order.
    pub profiles: Vec<String>,
    /// Local configuration.
    pub config: ConfigMap,
    /// Local devices.
    pub devices: Devices,
    /// Snapshot expiry.
    pub expiry_date: Option<DateTime<Utc>>,
}

impl UpdateArgs {
    /// The editable fields of `record`, unchanged.
    #[must_use]
    pub fn from_record(record: &ContainerRecord) -> Self {
        Self {
            description: record.description.clone(),
            ephemeral: record.ephemeral,
            profiles: record.profiles.clone(),
            config: record.config.clone(),
            devices: record.devices.clone(),
            expiry_date: record.expiry_date,
        }
    }
}

/// In-memory state of a container before an update.
#[derive(Debug, Clone)]
pub struct UpdateSnapshot {
    data: ContainerData,
}

impl UpdateSnapshot {
    /// Captures the current record and expansion of `container`.
    #[must_use]
    pub fn capture(container: &Container) -> Self {
        Self {
            data: container.data(),
        }
    }

    /// Puts the captured state back. Only memory is restored.
    pub fn restore(self, container: &Container) {
        *container.write() = self.data;
    }
}

/// Keys whose expanded value differs between `old` and `new`.
fn changed_keys(old: &ConfigMap, new: &ConfigMap) -> BTreeSet<String> {
    old.keys()
        .chain(new.keys())
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect()
}

fn set_items(handle: &dyn RuntimeHandle, items: &[CgroupItem]) -> Result<()> {
    for item in items {
        handle.set_cgroup_item(item.key, &item.value)?;
    }
    Ok(())
}

impl Container {
    /// Replaces the editable fields and applies the difference, live when
    /// the container runs.
    ///
    /// `user_requested` updates may not change `volatile.*` or `image.*`
    /// keys; those are carried over from the current configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error before anything changes, or the failure
    /// of a storage, cgroup or device step after the in-memory state was
    /// put back.
    pub fn update(&self, args: UpdateArgs, user_requested: bool) -> Result<()> {
        let name = self.name();
        let snapshot = UpdateSnapshot::capture(self);
        if let Err(e) = self.update_inner(args, user_requested) {
            snapshot.restore(self);
            tracing::warn!(container = %name, error = %e, "update failed, in-memory state restored");
            return Err(e.in_lifecycle("update", &name));
        }
        tracing::info!(container = %name, "container updated");
        self.emit("container-updated");
        Ok(())
    }

    fn update_inner(&self, args: UpdateArgs, user_requested: bool) -> Result<()> {
        let services = &self.services;
        validate_profiles(&args.profiles)?;
        validate_config(&args.config)?;
        validate_devices(&args.devices, false)?;

        let old = self.data();
        let config = if user_requested {
            merge_read_only(&old.record.config, &args.config)?
        } else {
            args.config
        };
        let profiles = services.store.resolve_profiles(&args.profiles)?;
        let mut record = old.record.clone();
        record.description = args.description;
        record.ephemeral = args.ephemeral;
        record.profiles = args.profiles;
        record.config = config;
        record.devices = args.devices;
        record.expiry_date = args.expiry_date;
        let new = ContainerData::new(record, profiles);
        validate_config(&new.expanded_config)?;
        validate_devices(&new.expanded_devices, true)?;

        let changed = changed_keys(&old.expanded_config, &new.expanded_config);
        let devices = diff(&old.expanded_devices, &new.expanded_devices);
        let running = !self.is_snapshot() && self.is_running();
        let deferred_quota = self.check_root_disk(&old.expanded_devices, &new.expanded_devices, running)?;

        *self.write() = new;
        if let Some(size) = deferred_quota {
            self.write()
                .apply(&[(keys::VOLATILE_APPLY_QUOTA.to_string(), Some(size))]);
        }

        // The allocator lock is held until the record is written.
        let _allocation = if changed.iter().any(|k| idmap_sensitive(k)) {
            let allocation = services
                .idmap
                .allocate(services.store.as_ref(), &self.name(), &self.expanded_config())?;
            self.write().apply(&allocation.volatile_changes()?);
            Some(allocation)
        } else {
            None
        };

        if running {
            self.update_live(&old, &changed, &devices)?;
        }
        self.drop_stale_volatile();
        services.store.update_container(&self.record())
    }

    /// The root disk's pool is fixed. A new size is applied now when the
    /// storage layer allows it; otherwise it is returned to be applied on
    /// next start.
    fn check_root_disk(&self, old: &Devices, new: &Devices, running: bool) -> Result<Option<String>> {
        let (Ok((_, before)), Ok((_, after))) = (old.root_disk(), new.root_disk()) else {
            return Ok(None);
        };
        if before.value("pool") != after.value("pool") {
            return Err(CorralError::validation("the storage pool of the root disk can't be changed"));
        }
        let size = after.value("size");
        if size.is_empty() || before.value("size") == size {
            return Ok(None);
        }
        let storage = &self.services.storage;
        if !running || storage.supports_online_resize() {
            storage.set_quota(&self.name(), size)?;
            return Ok(None);
        }
        tracing::info!(container = %self.name(), size, "root disk resize deferred to next start");
        Ok(Some(size.to_string()))
    }

    fn update_live(&self, old: &ContainerData, changed: &BTreeSet<String>, devices: &DeviceDiff) -> Result<()> {
        let services = &self.services;
        let driver = &services.driver;
        let handle = self.handle()?;
        let config = self.expanded_config();
        let value = |key: &str| config.get(key).map_or("", String::as_str);

        if changed.contains(keys::LINUX_KERNEL_MODULES) && !value(keys::LINUX_KERNEL_MODULES).is_empty() {
            load_modules(&driver.sysfs_root, value(keys::LINUX_KERNEL_MODULES))?;
        }
        if MEMORY_KEYS.iter().any(|k| changed.contains(*k)) {
            let previous = memory_limit_items(&old.expanded_config, driver)?;
            let wanted = memory_limit_items(&config, driver)?;
            if let Err(e) = set_items(handle.as_ref(), &wanted) {
                let rollback = set_items(handle.as_ref(), &previous).err();
                return Err(e.with_rollback(rollback));
            }
        }
        if changed.contains(keys::LIMITS_CPU_ALLOWANCE) || changed.contains(keys::LIMITS_CPU_PRIORITY) {
            let items = cpu_items(value(keys::LIMITS_CPU_ALLOWANCE), value(keys::LIMITS_CPU_PRIORITY))?;
            set_items(handle.as_ref(), &items)?;
        }
        if changed.contains(keys::LIMITS_DISK_PRIORITY) {
            set_items(handle.as_ref(), &[io_weight_item(value(keys::LIMITS_DISK_PRIORITY))?])?;
        }
        if changed.contains(keys::LIMITS_PROCESSES) && driver.cgroup_pids {
            set_items(handle.as_ref(), &[pids_item(value(keys::LIMITS_PROCESSES))?])?;
        }
        if changed.contains(keys::LIMITS_NETWORK_PRIORITY) {
            self.apply_network_priority();
        }

        if devices.is_empty() {
            return Ok(());
        }
        let scope = self.device_scope(Some(handle))?;
        let outcome = reconcile_live(&scope.context(services), &old.expanded_devices, devices)?;
        self.write().apply(&outcome.volatile);
        self.watch_missing(outcome.watches);
        for name in devices.removed.names() {
            if self.read().expanded_devices.get(name).is_none() {
                self.services.hotplug.unregister(&scope.name, name);
            }
        }
        Ok(())
    }

    /// Drops `volatile.<dev>.{name,hwaddr,host_name}` of nics that are gone
    /// or now configure the value themselves.
    fn drop_stale_volatile(&self) {
        let stale: Vec<(String, Option<String>)> = {
            let data = self.read();
            data.record
                .config
                .keys()
                .filter_map(|key| {
                    let rest = key.strip_prefix(keys::VOLATILE_PREFIX)?;
                    let (device, suffix) = rest.split_once('.')?;
                    if !NIC_VOLATILE_SUFFIXES.contains(&suffix) {
                        return None;
                    }
                    let live = data.expanded_devices.get(device).filter(|d| {
                        matches!(d.kind(), Ok(DeviceKind::Nic | DeviceKind::Infiniband))
                    });
                    match live {
                        Some(nic) if nic.value(suffix).is_empty() => None,
                        _ => Some((key.clone(), None)),
                    }
                })
                .collect()
        };
        if !stale.is_empty() {
            self.write().apply(&stale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn changed_keys_cover_additions_and_removals() {
        let old = config(&[("limits.memory", "1GB"), ("limits.cpu.priority", "5")]);
        let new = config(&[("limits.memory", "2GB"), ("limits.processes", "10")]);
        let changed: Vec<String> = changed_keys(&old, &new).into_iter().collect();
        assert_eq!(changed, vec!["limits.cpu.priority", "limits.memory", "limits.processes"]);
    }

    #[test]
    fn idmap_keys_are_recognised() {
        assert!(idmap_sensitive("security.privileged"));
        assert!(idmap_sensitive("security.idmap.size"));
        assert!(idmap_sensitive("raw.idmap"));
        assert!(!idmap_sensitive("security.nesting"));
    }

    #[test]
    fn args_mirror_the_record() {
        let mut record = ContainerRecord::new("c1");
        record.description = "web".into();
        let args = UpdateArgs::from_record(&record);
        assert_eq!(args.description, "web");
        assert_eq!(args.profiles, vec!["default".to_string()]);
        assert!(args.devices.is_empty());
    }
}
