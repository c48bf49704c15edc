//! Start: idmap transition, device realization and hand-off to the
//! runtime library.

use std::path::Path;
use std::sync::Arc;

use corral_common::constants::keys;
use corral_common::device::DeviceKind;
use corral_common::error::{CorralError, Result};
use corral_common::types::{OperationAction, config_is_true};
use corral_core::idmap::{IdmapSet, optional_equivalent, optional_to_json};
use corral_core::kmod::load_modules;

use super::Container;
use super::config::{raw_items, runtime_items};
use crate::backend::{MigrateCommand, MigrateOptions, RuntimeHandle};
use crate::device::{Phase, attach_all, handler_for, remove_leftovers, unix};
use crate::logs;

fn io_err(path: &Path, source: std::io::Error) -> CorralError {
    CorralError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Container {
    /// Starts the container, or restores its checkpoint when `stateful`.
    ///
    /// The start operation is finished before proxy devices come up; when
    /// one of them fails the container is stopped again.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Busy`] when another operation is live, an
    /// invalid-state error when the container already runs, and any
    /// preparation or runtime library failure, each wrapped with the
    /// action and container name.
    pub fn start(&self, stateful: bool) -> Result<()> {
        let name = self.name();
        let op = self
            .services
            .operations
            .create(&name, OperationAction::Start, false, false)
            .map_err(|e| e.in_lifecycle("start", &name))?;
        tracing::info!(container = %name, stateful, "starting container");

        let result = self.start_common(stateful);
        op.done(result.as_ref().err());
        result.map_err(|e| e.in_lifecycle("start", &name))?;

        if let Err(e) = self.start_proxies() {
            tracing::error!(container = %name, error = %e, "failed to start proxy devices, stopping container");
            if let Err(stop) = self.stop(false) {
                tracing::warn!(container = %name, error = %stop, "failed to stop container after proxy failure");
            }
            return Err(e.in_lifecycle("start", &name));
        }

        tracing::info!(container = %name, "container started");
        self.emit("container-started");
        Ok(())
    }

    fn start_common(&self, stateful: bool) -> Result<()> {
        if self.is_snapshot() {
            return Err(CorralError::invalid_state("snapshots cannot be started"));
        }
        if self.is_running() {
            return Err(CorralError::invalid_state("the container is already running"));
        }
        if stateful && !self.is_stateful() {
            return Err(CorralError::invalid_state("container has no existing state to restore"));
        }
        let name = self.name();
        self.check_start_devices()?;

        let modules = self.config_value(keys::LINUX_KERNEL_MODULES);
        if !modules.is_empty() {
            load_modules(&self.services.driver.sysfs_root, &modules)?;
        }
        self.apply_pending_quota()?;
        self.remap_rootfs()?;
        let current = optional_to_json(self.next_idmap()?.as_ref())?;
        if self.local_value(keys::VOLATILE_IDMAP_CURRENT).as_deref() != Some(current.as_str()) {
            self.set_config_key(keys::VOLATILE_IDMAP_CURRENT, Some(current))?;
        }
        self.remove_device_leftovers();

        let mounted = self.services.storage.mount(&name)?;
        let result = self.launch(&name, stateful);
        if result.is_err() && mounted {
            if let Err(e) = self.services.storage.unmount(&name) {
                tracing::warn!(container = %name, error = %e, "failed to unmount storage after failed start");
            }
        }
        result
    }

    /// Device checks that must pass before anything is changed.
    fn check_start_devices(&self) -> Result<()> {
        let devices = self.expanded_devices();
        for (name, device) in devices.iter() {
            match device.kind()? {
                DeviceKind::Disk => {
                    let source = device.value("source");
                    if device.value("pool").is_empty()
                        && !source.is_empty()
                        && !device.is_true("optional")
                        && !Path::new(source).exists()
                    {
                        return Err(CorralError::validation(format!(
                            "missing source {source:?} for disk {name}"
                        )));
                    }
                }
                DeviceKind::Nic => {
                    let parent = device.value("parent");
                    if !parent.is_empty() && !self.services.network.interface_exists(parent) {
                        return Err(CorralError::validation(format!(
                            "missing parent {parent:?} for nic {name}"
                        )));
                    }
                }
                DeviceKind::UnixChar | DeviceKind::UnixBlock => {
                    let source = unix::source_path(device);
                    if unix::is_required(device)
                        && (device.value("major").is_empty() || device.value("minor").is_empty())
                        && !Path::new(source).exists()
                    {
                        return Err(CorralError::validation(format!(
                            "missing source {source:?} for device {name}"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_pending_quota(&self) -> Result<()> {
        let Some(size) = self.local_value(keys::VOLATILE_APPLY_QUOTA).filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        self.services.storage.set_quota(&self.name(), &size)?;
        self.set_config_key(keys::VOLATILE_APPLY_QUOTA, None)
    }

    /// Moves the root filesystem from the disk idmap to the next one.
    ///
    /// Either the shift completes and the disk map is updated, or the
    /// filesystem is brought back to the disk map and the error returned.
    fn remap_rootfs(&self) -> Result<()> {
        let next = self.next_idmap()?;
        let disk = self.disk_idmap()?;
        let shiftfs = self.services.driver.shiftfs;
        if optional_equivalent(next.as_ref(), disk.as_ref()) || (disk.is_none() && shiftfs) {
            return Ok(());
        }
        if config_is_true(&self.expanded_config(), keys::SECURITY_PROTECTION_SHIFT) {
            return Err(CorralError::Protected {
                message: "container is protected against filesystem shifting".into(),
            });
        }

        let name = self.name();
        tracing::info!(container = %name, "idmap changed, remapping root filesystem");
        let storage = &self.services.storage;
        let mounted = storage.mount(&name)?;
        let target = next.as_ref().filter(|_| !shiftfs);
        let result = self.shift_rootfs(&name, disk.as_ref(), target);
        if mounted {
            if let Err(e) = storage.unmount(&name) {
                tracing::warn!(container = %name, error = %e, "failed to unmount storage after remapping");
            }
        }
        result?;

        let disk_json = optional_to_json(target)?;
        self.set_config_key(keys::VOLATILE_LAST_STATE_IDMAP, Some(disk_json))
    }

    fn shift_rootfs(&self, name: &str, disk: Option<&IdmapSet>, next: Option<&IdmapSet>) -> Result<()> {
        let storage = &self.services.storage;
        if let Some(disk) = disk {
            if let Err(e) = storage.unshift_rootfs(name, disk) {
                let rollback = storage.shift_rootfs(name, disk).err();
                return Err(e.with_rollback(rollback));
            }
        }
        let Some(next) = next else {
            return Ok(());
        };
        if let Err(e) = storage.shift_rootfs(name, next) {
            tracing::error!(container = name, error = %e, "shift failed, restoring the previous idmap");
            let mut rollback = storage.unshift_rootfs(name, next).err();
            if rollback.is_none() {
                if let Some(disk) = disk {
                    rollback = storage.shift_rootfs(name, disk).err();
                }
            }
            return Err(e.with_rollback(rollback));
        }
        Ok(())
    }

    /// Clears files and helpers left behind by an unclean stop.
    fn remove_device_leftovers(&self) {
        let devices_dir = self.devices_path();
        let removed = remove_leftovers(&devices_dir, "unix") + remove_leftovers(&devices_dir, "disk");
        if let Ok(scope) = self.device_scope(None) {
            let ctx = scope.context(&self.services);
            for (name, device) in scope.devices.of_kind(DeviceKind::Proxy) {
                let _ = handler_for(DeviceKind::Proxy).cleanup(&ctx, name, device);
            }
        }
        let removed = removed + remove_leftovers(&devices_dir, "proxy");
        if removed > 0 {
            tracing::debug!(container = %self.name(), removed, "removed device leftovers");
        }
    }

    fn launch(&self, name: &str, stateful: bool) -> Result<()> {
        let services = &self.services;
        self.release_handle();
        let handle = self.handle()?;
        let scope = self.device_scope(Some(Arc::clone(&handle)))?;
        let ctx = scope.context(services);

        let rootfs = services.storage.rootfs_path(name);
        let mut items = runtime_items(name, &rootfs, &scope.config, scope.idmap.as_ref(), &services.driver)?;
        ctx.ensure_devices_dir()?;
        let outcome = attach_all(&ctx, &scope.devices, Phase::Boot)?;
        items.extend(outcome.config_items);
        items.extend(raw_items(&scope.config)?);
        self.apply_config_changes(&outcome.volatile)?;
        self.watch_missing(outcome.watches);
        for (key, value) in &items {
            handle.set_config_item(key, value)?;
        }

        let log_dir = self.log_path();
        std::fs::create_dir_all(&log_dir).map_err(|e| io_err(&log_dir, e))?;
        let log_file = logs::log_file_path(&services.driver.log_dir, name);
        logs::rotate(&log_file)?;
        let config_path = logs::config_path(&services.driver.log_dir, name);
        handle.save_config_file(&config_path)?;

        if stateful {
            return self.restore_checkpoint(handle.as_ref());
        }
        if self.is_stateful() {
            self.clear_checkpoint()?;
        }

        if let Err(e) = handle.start(&config_path) {
            if !self.is_running() {
                let detail = logs::error_lines(&log_file);
                return Err(CorralError::external(
                    "the runtime library failed to start the container",
                    format!("{e}{detail}"),
                ));
            }
            tracing::warn!(container = name, error = %e, "start reported a failure but the container runs");
        }
        Ok(())
    }

    fn restore_checkpoint(&self, handle: &dyn RuntimeHandle) -> Result<()> {
        let options = MigrateOptions {
            directory: self.state_path(),
            stop: false,
            verbose: false,
        };
        if let Err(e) = handle.migrate(MigrateCommand::Restore, &options) {
            if !self.is_running() {
                return Err(e);
            }
        }
        self.clear_checkpoint()
    }

    /// Removes the state directory and the stateful flag.
    pub(crate) fn clear_checkpoint(&self) -> Result<()> {
        let state = self.state_path();
        if state.exists() {
            std::fs::remove_dir_all(&state).map_err(|e| io_err(&state, e))?;
        }
        self.update_record(|record| record.stateful = false)
    }

    /// Starts the helpers of proxy devices on the running container.
    fn start_proxies(&self) -> Result<()> {
        let devices = self.expanded_devices();
        if devices.of_kind(DeviceKind::Proxy).next().is_none() {
            return Ok(());
        }
        let scope = self.device_scope(Some(self.handle()?))?;
        let ctx = scope.context(&self.services);
        for (name, device) in scope.devices.of_kind(DeviceKind::Proxy) {
            let outcome = handler_for(DeviceKind::Proxy).attach(&ctx, name, device, Phase::Live)?;
            self.apply_config_changes(&outcome.volatile)?;
        }
        Ok(())
    }
}
