//! Callbacks from the runtime library.

use std::sync::Arc;

use chrono::Utc;
use corral_common::constants::keys;
use corral_common::device::DeviceKind;
use corral_common::error::{CorralError, Result};
use corral_common::types::{OperationAction, PowerState, StopTarget};

use super::Container;
use crate::backend::LifecycleHooks;
use crate::device::{cleanup_all, nic, remove_leftovers};
use crate::operation::Operation;

impl Container {
    /// Sets `net_prio.ifpriomap` for every nic of the running container.
    /// Failures are logged.
    pub(super) fn apply_network_priority(&self) {
        let priority = self.config_value(keys::LIMITS_NETWORK_PRIORITY);
        if priority.is_empty() {
            return;
        }
        let name = self.name();
        let Ok(handle) = self.handle() else {
            return;
        };
        let Ok(scope) = self.device_scope(None) else {
            return;
        };
        let ctx = scope.context(&self.services);
        for (device, config) in scope.devices.of_kind(DeviceKind::Nic) {
            let interface = nic::interface_name(&ctx, device, config);
            if interface.is_empty() {
                continue;
            }
            if let Err(e) = handle.set_cgroup_item("net_prio.ifpriomap", &format!("{interface} {priority}")) {
                tracing::warn!(container = %name, device, error = %e, "failed to set network priority");
            }
        }
    }

    /// Post-stop host cleanup that must happen before the hook returns.
    fn release_host_resources(&self) -> Result<()> {
        let name = self.name();
        let scope = self.device_scope(None)?;
        let outcome = cleanup_all(&scope.context(&self.services), &scope.devices);
        self.apply_config_changes(&outcome.volatile)?;
        if let Err(e) = self.services.storage.unmount(&name) {
            tracing::warn!(container = %name, error = %e, "failed to unmount storage after stop");
        }
        self.update_record(|record| record.power_state = PowerState::Stopped)
    }

    /// Remaining cleanup, then reboot or ephemeral removal, then finishes
    /// the stop operation.
    fn complete_stop(&self, target: StopTarget, op: &Arc<Operation>) {
        let name = self.name();
        if let Err(e) = self.services.security.unload(&name) {
            tracing::warn!(container = %name, error = %e, "failed to unload security profile");
        }
        let devices_dir = self.devices_path();
        let _ = remove_leftovers(&devices_dir, "unix") + remove_leftovers(&devices_dir, "disk");
        self.services.hotplug.unregister_container(&name);
        self.release_handle();

        if target == StopTarget::Reboot {
            op.done(None);
            tracing::info!(container = %name, "rebooting container");
            if let Err(e) = self.start(false) {
                tracing::error!(container = %name, error = %e, "failed to restart container");
            }
            return;
        }
        if self.is_ephemeral() {
            let result = self.delete();
            if let Err(e) = &result {
                tracing::error!(container = %name, error = %e, "failed to delete ephemeral container");
            }
            op.done(result.as_ref().err());
            return;
        }
        op.done(None);
    }

    /// The stop operation the hook belongs to. A stop initiated from inside
    /// the container has none yet.
    fn stop_operation(&self) -> Result<Arc<Operation>> {
        let name = self.name();
        let operations = &self.services.operations;
        match operations.get(&name, None) {
            Ok(op) if op.action() == OperationAction::Stop => Ok(op),
            Ok(op) => Err(CorralError::OperationMismatch {
                running: op.action().to_string(),
                wanted: OperationAction::Stop.to_string(),
            }),
            Err(_) => operations.create(&name, OperationAction::Stop, false, true),
        }
    }
}

impl LifecycleHooks for Container {
    fn on_start(&self) -> Result<()> {
        let name = self.name();
        let _ = self.services.storage.mount(&name)?;
        if let Err(e) = self.services.security.load(&name) {
            if let Err(unmount) = self.services.storage.unmount(&name) {
                tracing::warn!(container = %name, error = %unmount, "failed to unmount storage");
            }
            return Err(e);
        }
        self.update_record(|record| {
            record.power_state = PowerState::Running;
            record.last_used_at = Some(Utc::now());
        })?;
        self.apply_network_priority();
        tracing::debug!(container = %name, "start hook done");
        Ok(())
    }

    fn on_stop_ns(&self, target: &str, netns: &str) -> Result<()> {
        let _: StopTarget = target.parse()?;
        let name = self.name();
        tracing::debug!(container = %name, target, netns, "stop namespace hook");
        let scope = self.device_scope(None)?;
        let ctx = scope.context(&self.services);
        let mut changes = Vec::new();
        for (device, config) in scope.devices.of_kind(DeviceKind::Nic) {
            if nic::nic_type(config).is_ok_and(nic::NicType::is_passthrough) {
                changes.extend(nic::restore_host_properties(&ctx, device, config).volatile);
            }
        }
        self.apply_config_changes(&changes)
    }

    fn on_stop(&self, target: &str) -> Result<()> {
        let target: StopTarget = target.parse()?;
        let name = self.name();
        let op = self.stop_operation()?;
        tracing::info!(container = %name, %target, "container stopped by the runtime library");

        if let Err(e) = self.release_host_resources() {
            op.done(Some(&e));
            return Err(e);
        }

        if self.services.runtime.hooks_in_process() {
            if let Some(this) = self.this.upgrade() {
                let pending = Arc::clone(&op);
                let spawned = std::thread::Builder::new()
                    .name("corral-stop-cleanup".into())
                    .spawn(move || this.complete_stop(target, &pending));
                if spawned.is_ok() {
                    return Ok(());
                }
            }
        }
        self.complete_stop(target, &op);
        Ok(())
    }

    fn on_network_up(&self, device: &str, host_name: &str) -> Result<()> {
        let devices = self.expanded_devices();
        let config = devices
            .get(device)
            .ok_or_else(|| CorralError::validation(format!("unknown device {device}")))?;
        if config.kind()? != DeviceKind::Nic || !nic::nic_type(config)?.is_veth() {
            return Ok(());
        }
        let scope = self.device_scope(None)?;
        let outcome = nic::network_up(&scope.context(&self.services), device, config, host_name)?;
        self.apply_config_changes(&outcome.volatile)
    }
}
