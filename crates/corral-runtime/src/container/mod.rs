//! A container or snapshot and its lifecycle.
//!
//! Entry points live in submodules: `start`, `stop` (stop, shutdown,
//! freeze), `hooks`, `update`, `snapshot` (snapshot and restore), `delete`
//! and `rename`. No internal lock is held across a runtime library call
//! or a hook: the handle is cloned out of its slot first.

mod config;
mod delete;
mod hooks;
mod rename;
mod snapshot;
mod start;
mod stop;
mod update;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak, mpsc};

use corral_common::config::DriverConfig;
use corral_common::constants::{SNAPSHOT_DELIMITER, keys};
use corral_common::device::Devices;
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfigMap, StatusCode, config_is_true};
use corral_core::idmap::IdmapSet;

use crate::backend::{LifecycleHooks, RuntimeHandle};
use crate::device::{DeviceContext, Phase, handler_for};
use crate::engine::Services;
use crate::events::LifecycleEvent;
use crate::expand::{Profile, expand_config, expand_devices};
use crate::logs;
use crate::store::ContainerRecord;

pub use config::{raw_items, runtime_items};
pub use update::{UpdateArgs, UpdateSnapshot};

/// Record, profiles and their expansion.
#[derive(Debug, Clone)]
pub struct ContainerData {
    /// Persistent record.
    pub record: ContainerRecord,
    /// Resolved profiles, in application order.
    pub profiles: Vec<Profile>,
    /// Profiles and local keys merged.
    pub expanded_config: ConfigMap,
    /// Profiles and local devices merged.
    pub expanded_devices: Devices,
}

impl ContainerData {
    fn new(record: ContainerRecord, profiles: Vec<Profile>) -> Self {
        let mut data = Self {
            record,
            profiles,
            expanded_config: ConfigMap::new(),
            expanded_devices: Devices::new(),
        };
        data.expand();
        data
    }

    fn expand(&mut self) {
        self.expanded_config = expand_config(&self.record.config, &self.profiles);
        self.expanded_devices = expand_devices(&self.record.devices, &self.profiles);
    }

    fn apply(&mut self, changes: &[(String, Option<String>)]) {
        for (key, value) in changes {
            match value {
                Some(value) => {
                    let _ = self.record.config.insert(key.clone(), value.clone());
                }
                None => {
                    let _ = self.record.config.remove(key);
                }
            }
        }
        self.expanded_config = expand_config(&self.record.config, &self.profiles);
    }
}

/// Directory of a container's volume, devices and checkpoint state.
#[must_use]
pub fn container_path(driver: &DriverConfig, name: &str) -> PathBuf {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snapshot)) => driver.data_dir.join("snapshots").join(parent).join(snapshot),
        None => driver.containers_dir().join(name),
    }
}

/// Owned copies of what device handlers read, so that no container lock
/// is held while they run.
pub(crate) struct DeviceScope {
    pub(crate) name: String,
    pub(crate) devices_dir: PathBuf,
    pub(crate) config: ConfigMap,
    pub(crate) devices: Devices,
    pub(crate) idmap: Option<IdmapSet>,
    pub(crate) handle: Option<Arc<dyn RuntimeHandle>>,
}

impl DeviceScope {
    pub(crate) fn context<'a>(&'a self, services: &'a Services) -> DeviceContext<'a> {
        DeviceContext {
            container: &self.name,
            devices_dir: &self.devices_dir,
            config: &self.config,
            devices: &self.devices,
            idmap: self.idmap.as_ref(),
            handle: self.handle.as_deref(),
            runtime: services.runtime.as_ref(),
            driver: &services.driver,
            storage: services.storage.as_ref(),
            network: services.network.as_ref(),
        }
    }
}

/// A loaded container or snapshot.
///
/// Obtained from [`crate::engine::Engine`]; there is at most one live
/// instance per name in a process.
pub struct Container {
    services: Arc<Services>,
    this: Weak<Self>,
    data: RwLock<ContainerData>,
    handle: Mutex<Option<Arc<dyn RuntimeHandle>>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.read().record.name)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub(crate) fn new(services: Arc<Services>, record: ContainerRecord, profiles: Vec<Profile>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            services,
            this: this.clone(),
            data: RwLock::new(ContainerData::new(record, profiles)),
            handle: Mutex::new(None),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ContainerData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContainerData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Container name; snapshots are `<parent>/<snapshot>`.
    #[must_use]
    pub fn name(&self) -> String {
        self.read().record.name.clone()
    }

    /// Copy of the persistent record.
    #[must_use]
    pub fn record(&self) -> ContainerRecord {
        self.read().record.clone()
    }

    /// Copy of the record, profiles and expansion.
    #[must_use]
    pub fn data(&self) -> ContainerData {
        self.read().clone()
    }

    /// Local configuration keys.
    #[must_use]
    pub fn local_config(&self) -> ConfigMap {
        self.read().record.config.clone()
    }

    /// Configuration after profile expansion.
    #[must_use]
    pub fn expanded_config(&self) -> ConfigMap {
        self.read().expanded_config.clone()
    }

    /// Devices after profile expansion.
    #[must_use]
    pub fn expanded_devices(&self) -> Devices {
        self.read().expanded_devices.clone()
    }

    /// Whether this is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.read().record.is_snapshot()
    }

    /// Whether the container is deleted when it stops.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.read().record.ephemeral
    }

    /// Whether a checkpoint is stored in the state directory.
    #[must_use]
    pub fn is_stateful(&self) -> bool {
        self.read().record.stateful
    }

    /// Whether the container runs without an idmap.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        config_is_true(&self.read().expanded_config, keys::SECURITY_PRIVILEGED)
    }

    /// Directory holding the volume, `devices/` and `state/`.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        container_path(&self.services.driver, &self.name())
    }

    /// Directory of device nodes, mount points and helper pid files.
    #[must_use]
    pub fn devices_path(&self) -> PathBuf {
        self.path().join("devices")
    }

    /// Directory of the stateful checkpoint.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path().join("state")
    }

    /// Log directory.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        logs::log_dir(&self.services.driver.log_dir, &self.name())
    }

    pub(crate) fn local_value(&self, key: &str) -> Option<String> {
        self.read().record.config.get(key).cloned()
    }

    pub(crate) fn config_value(&self, key: &str) -> String {
        self.read().expanded_config.get(key).cloned().unwrap_or_default()
    }

    fn idmap_key(&self, key: &str) -> Result<Option<Option<IdmapSet>>> {
        match self.local_value(key).filter(|v| !v.is_empty()) {
            Some(json) => Ok(Some(IdmapSet::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Idmap the next start will use. Falls back to the current map.
    ///
    /// # Errors
    ///
    /// Returns an error when a stored map cannot be parsed.
    pub fn next_idmap(&self) -> Result<Option<IdmapSet>> {
        match self.idmap_key(keys::VOLATILE_IDMAP_NEXT)? {
            Some(map) => Ok(map),
            None => self.current_idmap(),
        }
    }

    /// Idmap the container runs with. Falls back to the disk map.
    ///
    /// # Errors
    ///
    /// Returns an error when a stored map cannot be parsed.
    pub fn current_idmap(&self) -> Result<Option<IdmapSet>> {
        match self.idmap_key(keys::VOLATILE_IDMAP_CURRENT)? {
            Some(map) => Ok(map),
            None => self.disk_idmap(),
        }
    }

    /// Idmap the root filesystem is shifted to.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored map cannot be parsed.
    pub fn disk_idmap(&self) -> Result<Option<IdmapSet>> {
        Ok(self.idmap_key(keys::VOLATILE_LAST_STATE_IDMAP)?.flatten())
    }

    /// The runtime handle, created on first use.
    pub(crate) fn handle(&self) -> Result<Arc<dyn RuntimeHandle>> {
        let name = self.name();
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let hooks: Weak<dyn LifecycleHooks> = self.this.clone();
        let handle = self.services.runtime.new_handle(&name, hooks)?;
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops the runtime handle; the next use creates a fresh one.
    pub(crate) fn release_handle(&self) {
        let released = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(released);
    }

    fn probe(&self) -> (StatusCode, Option<CorralError>) {
        if self.is_snapshot() {
            return (StatusCode::Stopped, None);
        }
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(e) => return (StatusCode::Error, Some(e)),
        };
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("corral-state-probe".into())
            .spawn(move || {
                let _ = tx.send(handle.state());
            });
        if let Err(e) = spawned {
            return (StatusCode::Error, Some(CorralError::external("failed to probe state", e)));
        }
        match rx.recv_timeout(self.services.driver.state_probe_timeout()) {
            Ok(Ok(state)) => (state, None),
            Ok(Err(e)) => (StatusCode::Error, Some(e)),
            Err(_) => {
                tracing::warn!(container = %self.name(), "state probe timed out, monitor is hung");
                (StatusCode::Frozen, Some(CorralError::MonitorHung))
            }
        }
    }

    /// Live state as reported by the runtime library.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::MonitorHung`] when the library does not answer
    /// in time, or the library's error.
    pub fn state(&self) -> Result<StatusCode> {
        match self.probe() {
            (state, None) => Ok(state),
            (_, Some(e)) => Err(e),
        }
    }

    /// Live state, [`StatusCode::Error`] when it cannot be determined.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.state().unwrap_or(StatusCode::Error)
    }

    /// Whether the container has live processes. A hung monitor counts as
    /// running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.probe().0.is_running()
    }

    /// Whether the container is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.status().is_frozen()
    }

    /// Persists local configuration changes and applies them in memory.
    pub(crate) fn apply_config_changes(&self, changes: &[(String, Option<String>)]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let name = self.name();
        self.services.store.update_config(&name, changes)?;
        self.write().apply(changes);
        Ok(())
    }

    pub(crate) fn set_config_key(&self, key: &str, value: Option<String>) -> Result<()> {
        self.apply_config_changes(&[(key.to_string(), value)])
    }

    /// Changes the stored record in one transaction and reloads it.
    pub(crate) fn update_record(&self, change: impl FnOnce(&mut ContainerRecord)) -> Result<()> {
        let name = self.name();
        let mut record = self.services.store.container(&name)?;
        change(&mut record);
        self.services.store.update_container(&record)?;
        let mut data = self.write();
        data.record = record;
        data.expand();
        Ok(())
    }

    pub(crate) fn device_scope(&self, handle: Option<Arc<dyn RuntimeHandle>>) -> Result<DeviceScope> {
        let idmap = self.current_idmap()?;
        let devices_dir = self.devices_path();
        let data = self.read();
        Ok(DeviceScope {
            name: data.record.name.clone(),
            devices_dir,
            config: data.expanded_config.clone(),
            devices: data.expanded_devices.clone(),
            idmap,
            handle,
        })
    }

    pub(crate) fn emit(&self, action: &str) {
        self.services.emit(LifecycleEvent::new(action, &self.name()));
    }

    /// Registers hotplug watches for optional devices whose source is
    /// missing.
    pub(crate) fn watch_missing(&self, watches: Vec<(String, PathBuf)>) {
        let name = self.name();
        for (device, target) in watches {
            let container = self.this.clone();
            let watched = device.clone();
            let registered = self.services.hotplug.register(&name, &device, &target, move || {
                if let Some(container) = container.upgrade() {
                    container.hotplug_attach(&watched);
                }
            });
            if let Err(e) = registered {
                tracing::warn!(container = %name, device, error = %e, "failed to watch missing device source");
            }
        }
    }

    /// Attaches a device whose source just appeared.
    fn hotplug_attach(&self, device: &str) {
        let name = self.name();
        if !self.is_running() {
            return;
        }
        let Some(config) = self.read().expanded_devices.get(device).cloned() else {
            return;
        };
        let result = (|| -> Result<()> {
            let scope = self.device_scope(Some(self.handle()?))?;
            let outcome = handler_for(config.kind()?).attach(&scope.context(&self.services), device, &config, Phase::Live)?;
            self.apply_config_changes(&outcome.volatile)?;
            self.watch_missing(outcome.watches);
            Ok(())
        })();
        match result {
            Ok(()) => tracing::info!(container = %name, device, "hotplugged device attached"),
            Err(e) => tracing::error!(container = %name, device, error = %e, "failed to attach hotplugged device"),
        }
    }
}
