//! Container and snapshot removal.

use corral_common::constants::keys;
use corral_common::device::DeviceKind;
use corral_common::error::{CorralError, Result};
use corral_common::types::config_is_true;

use super::Container;
use crate::device::{nic, proxy, remove_leftovers};
use crate::engine::load_container;

impl Container {
    /// Deletes the container with its snapshots, volume and host state, or
    /// just the snapshot when this is one.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Protected`] when `security.protection.delete`
    /// is set, or the first storage or store failure.
    pub fn delete(&self) -> Result<()> {
        let name = self.name();
        self.delete_inner().map_err(|e| e.in_lifecycle("delete", &name))?;
        self.release_handle();
        self.services.forget(&name);
        if self.is_snapshot() {
            tracing::info!(container = %name, "snapshot deleted");
            self.emit("container-snapshot-deleted");
        } else {
            tracing::info!(container = %name, "container deleted");
            self.emit("container-deleted");
        }
        Ok(())
    }

    fn delete_inner(&self) -> Result<()> {
        let services = &self.services;
        let name = self.name();
        if self.is_snapshot() {
            services.storage.delete(&name)?;
            return services.store.delete_container(&name);
        }
        if config_is_true(&self.expanded_config(), keys::SECURITY_PROTECTION_DELETE) {
            return Err(CorralError::Protected {
                message: "container is protected".into(),
            });
        }

        for snapshot in services.store.snapshots(&name)? {
            load_container(services, &snapshot.name)?.delete()?;
        }
        let backups = services.driver.backups_dir().join(&name);
        if backups.exists() {
            std::fs::remove_dir_all(&backups).map_err(|e| CorralError::Io {
                path: backups.clone(),
                source: e,
            })?;
        }

        self.remove_host_state();
        if let Err(e) = services.security.delete(&name) {
            tracing::warn!(container = %name, error = %e, "failed to delete security profile");
        }
        services.storage.delete(&name)?;
        self.clear_leases();
        services.hotplug.unregister_container(&name);
        services.store.delete_container(&name)
    }

    /// Stops proxy helpers and removes every device file.
    pub(super) fn remove_host_state(&self) {
        if let Ok(scope) = self.device_scope(None) {
            let ctx = scope.context(&self.services);
            for (device, _) in scope.devices.of_kind(DeviceKind::Proxy) {
                if let Err(e) = proxy::stop_helper(&ctx, device) {
                    tracing::warn!(container = %scope.name, device, error = %e, "failed to stop proxy helper");
                }
            }
        }
        let devices_dir = self.devices_path();
        let removed: usize = ["unix", "disk", "proxy"]
            .iter()
            .map(|prefix| remove_leftovers(&devices_dir, prefix))
            .sum();
        tracing::debug!(container = %self.name(), removed, "device files removed");
    }

    /// Releases the DHCP leases of bridged nics.
    fn clear_leases(&self) {
        let Ok(scope) = self.device_scope(None) else {
            return;
        };
        let ctx = scope.context(&self.services);
        for (device, config) in scope.devices.of_kind(DeviceKind::Nic) {
            if !matches!(nic::nic_type(config), Ok(nic::NicType::Bridged)) {
                continue;
            }
            let hwaddr = match config.value("hwaddr") {
                "" => ctx.volatile(device, "hwaddr"),
                configured => configured,
            };
            if hwaddr.is_empty() {
                continue;
            }
            if let Err(e) = self.services.network.clear_leases(config.value("parent"), &scope.name, hwaddr) {
                tracing::warn!(container = %scope.name, device, error = %e, "failed to clear DHCP leases");
            }
        }
    }
}
