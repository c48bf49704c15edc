//! In-memory collaborators for driving the lifecycle without LXC, real
//! storage or host networking.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use corral_common::config::DriverConfig;
use corral_common::device::{Device, Devices};
use corral_common::error::{CorralError, Result};
use corral_common::types::StatusCode;
use corral_core::idmap::IdmapSet;
use corral_runtime::backend::{
    LifecycleHooks, MigrateCommand, MigrateOptions, RuntimeHandle, RuntimeLibrary,
};
use corral_runtime::engine::{Collaborators, Engine, Services};
use corral_runtime::events::EventRecorder;
use corral_runtime::expand::Profile;
use corral_runtime::network::{NatRule, NetworkPlumbing};
use corral_runtime::security::Unconfined;
use corral_runtime::storage::{DirStorage, StorageDriver};
use corral_runtime::store::{ConfigStore, MemoryStore};
use tempfile::TempDir;

/// Bridge every fake host has.
pub const BRIDGE: &str = "br0";

// ── Runtime library ──────────────────────────────────────────────────

/// What the fake runtime knows about one container.
#[derive(Default)]
pub struct FakeState {
    status: Mutex<Option<StatusCode>>,
    hooks: Mutex<Option<Weak<dyn LifecycleHooks>>>,
    start_delay: Mutex<Duration>,
    failing_cgroup_key: Mutex<Option<String>>,
    starts: AtomicUsize,
    cgroup_writes: Mutex<Vec<(String, String)>>,
    config_items: Mutex<Vec<(String, String)>>,
    interfaces: Mutex<Vec<String>>,
    hung: AtomicBool,
}

impl FakeState {
    pub fn status(&self) -> StatusCode {
        self.status.lock().unwrap().unwrap_or(StatusCode::Stopped)
    }

    fn set_status(&self, status: StatusCode) {
        *self.status.lock().unwrap() = Some(status);
    }

    fn hooks(&self) -> Result<Arc<dyn LifecycleHooks>> {
        self.hooks
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CorralError::external("fake runtime", "container is gone"))
    }

    /// Makes every start take `delay` while the operation is held.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    /// Makes state queries block past the probe timeout.
    pub fn hang(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }

    /// Makes writes to `key` fail.
    pub fn fail_cgroup_key(&self, key: &str) {
        *self.failing_cgroup_key.lock().unwrap() = Some(key.to_string());
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn cgroup_writes(&self) -> Vec<(String, String)> {
        self.cgroup_writes.lock().unwrap().clone()
    }

    pub fn config_items(&self) -> Vec<(String, String)> {
        self.config_items.lock().unwrap().clone()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.interfaces.lock().unwrap().clone()
    }

    /// Brings the container down the way the runtime does, calling the
    /// stop hooks with `target`.
    fn go_down(&self, target: &str) -> Result<()> {
        self.set_status(StatusCode::Stopped);
        let hooks = self.hooks()?;
        hooks.on_stop_ns(target, "/proc/4242/ns/net")?;
        hooks.on_stop(target)
    }
}

/// Runtime library that runs hooks in process and keeps state in memory.
#[derive(Default)]
pub struct FakeRuntime {
    states: Mutex<HashMap<String, Arc<FakeState>>>,
}

impl FakeRuntime {
    /// State of `container`, created on first use.
    pub fn state(&self, container: &str) -> Arc<FakeState> {
        Arc::clone(
            self.states
                .lock()
                .unwrap()
                .entry(container.to_string())
                .or_default(),
        )
    }

    /// Simulates a reboot initiated from inside the container.
    pub fn reboot(&self, container: &str) -> Result<()> {
        self.state(container).go_down("reboot")
    }
}

impl RuntimeLibrary for FakeRuntime {
    fn new_handle(
        &self,
        container: &str,
        hooks: Weak<dyn LifecycleHooks>,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        let state = self.state(container);
        *state.hooks.lock().unwrap() = Some(hooks);
        Ok(Arc::new(FakeHandle { state }))
    }

    fn hooks_in_process(&self) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        true
    }
}

struct FakeHandle {
    state: Arc<FakeState>,
}

impl RuntimeHandle for FakeHandle {
    fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .config_items
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn config_item(&self, key: &str) -> Vec<String> {
        self.state
            .config_items
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn save_config_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let lines: Vec<String> = self
            .state
            .config_items()
            .iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .collect();
        std::fs::write(path, lines.join("\n")).unwrap();
        Ok(())
    }

    fn start(&self, _config_path: &Path) -> Result<()> {
        self.state.set_status(StatusCode::Starting);
        if let Err(e) = self.state.hooks()?.on_start() {
            self.state.set_status(StatusCode::Stopped);
            return Err(e);
        }
        let delay = *self.state.start_delay.lock().unwrap();
        std::thread::sleep(delay);
        self.state.set_status(StatusCode::Running);
        let _ = self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.state.go_down("stop")
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.state.go_down("stop")
    }

    fn freeze(&self) -> Result<()> {
        self.state.set_status(StatusCode::Frozen);
        Ok(())
    }

    fn unfreeze(&self) -> Result<()> {
        self.state.set_status(StatusCode::Running);
        Ok(())
    }

    fn state(&self) -> Result<StatusCode> {
        if self.state.hung.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1500));
        }
        Ok(self.state.status())
    }

    fn init_pid(&self) -> Option<u32> {
        self.state.status().is_running().then_some(4242)
    }

    fn migrate(&self, command: MigrateCommand, options: &MigrateOptions) -> Result<()> {
        match command {
            MigrateCommand::Dump => {
                std::fs::create_dir_all(&options.directory).unwrap();
                std::fs::write(options.directory.join("inventory.img"), "dump").unwrap();
                if options.stop {
                    self.state.go_down("stop")?;
                }
                Ok(())
            }
            MigrateCommand::Restore => {
                self.state.hooks()?.on_start()?;
                self.state.set_status(StatusCode::Running);
                let _ = self.state.starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn attach_interface(&self, host_name: &str, container_name: &str) -> Result<()> {
        self.state
            .interfaces
            .lock()
            .unwrap()
            .push(format!("attach {host_name} {container_name}"));
        Ok(())
    }

    fn detach_interface(&self, container_name: &str, host_name: &str) -> Result<()> {
        self.state
            .interfaces
            .lock()
            .unwrap()
            .push(format!("detach {container_name} {host_name}"));
        Ok(())
    }

    fn cgroup_item(&self, key: &str) -> Result<String> {
        Ok(self
            .state
            .cgroup_writes()
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .unwrap_or_default())
    }

    fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .cgroup_writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        if self.state.failing_cgroup_key.lock().unwrap().as_deref() == Some(key) {
            return Err(CorralError::external("failed to set cgroup item", key));
        }
        Ok(())
    }

    fn insert_mount(&self, _source: &Path, _target: &str, _readonly: bool) -> Result<()> {
        Ok(())
    }

    fn remove_mount(&self, _target: &str) -> Result<()> {
        Ok(())
    }
}

// ── Storage ──────────────────────────────────────────────────────────

/// Directory volumes that count the calls worth asserting on and accept
/// quotas.
pub struct CountingStorage {
    inner: DirStorage,
    online_resize: AtomicBool,
    shifts: AtomicUsize,
    unshifts: AtomicUsize,
    quotas: Mutex<Vec<(String, String)>>,
}

impl CountingStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: DirStorage::new("default", root),
            online_resize: AtomicBool::new(false),
            shifts: AtomicUsize::new(0),
            unshifts: AtomicUsize::new(0),
            quotas: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online_resize(&self, supported: bool) {
        self.online_resize.store(supported, Ordering::SeqCst);
    }

    pub fn shifts(&self) -> usize {
        self.shifts.load(Ordering::SeqCst)
    }

    pub fn unshifts(&self) -> usize {
        self.unshifts.load(Ordering::SeqCst)
    }

    pub fn quotas(&self) -> Vec<(String, String)> {
        self.quotas.lock().unwrap().clone()
    }
}

impl StorageDriver for CountingStorage {
    fn pool(&self) -> &str {
        self.inner.pool()
    }

    fn rootfs_path(&self, container: &str) -> std::path::PathBuf {
        self.inner.rootfs_path(container)
    }

    fn create(&self, container: &str) -> Result<()> {
        self.inner.create(container)
    }

    fn mount(&self, container: &str) -> Result<bool> {
        self.inner.mount(container)
    }

    fn unmount(&self, container: &str) -> Result<bool> {
        self.inner.unmount(container)
    }

    fn set_quota(&self, container: &str, size: &str) -> Result<()> {
        self.quotas
            .lock()
            .unwrap()
            .push((container.to_string(), size.to_string()));
        Ok(())
    }

    fn supports_online_resize(&self) -> bool {
        self.online_resize.load(Ordering::SeqCst)
    }

    fn snapshot(&self, container: &str, snapshot: &str) -> Result<()> {
        self.inner.snapshot(container, snapshot)
    }

    fn can_restore(&self, container: &str, snapshot: &str) -> Result<()> {
        self.inner.can_restore(container, snapshot)
    }

    fn restore(&self, container: &str, snapshot: &str) -> Result<()> {
        self.inner.restore(container, snapshot)
    }

    fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.inner.rename(container, new_name)
    }

    fn delete(&self, container: &str) -> Result<()> {
        self.inner.delete(container)
    }

    fn shift_rootfs(&self, _container: &str, _set: &IdmapSet) -> Result<()> {
        let _ = self.shifts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unshift_rootfs(&self, _container: &str, _set: &IdmapSet) -> Result<()> {
        let _ = self.unshifts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Network ──────────────────────────────────────────────────────────

/// Host network that records every call and tracks created links.
#[derive(Default)]
pub struct RecordingNetwork {
    calls: Mutex<Vec<String>>,
    links: Mutex<BTreeSet<String>>,
}

impl RecordingNetwork {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl NetworkPlumbing for RecordingNetwork {
    fn interface_exists(&self, name: &str) -> bool {
        name == BRIDGE || self.links.lock().unwrap().contains(name)
    }

    fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()> {
        self.record(format!("create_veth {host_name}"));
        let mut links = self.links.lock().unwrap();
        let _ = links.insert(host_name.to_string());
        let _ = links.insert(peer_name.to_string());
        Ok(())
    }

    fn create_macvlan(&self, name: &str, parent: &str) -> Result<()> {
        self.record(format!("create_macvlan {name} {parent}"));
        let _ = self.links.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        self.record(format!("attach_to_bridge {name} {bridge}"));
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.record(format!("delete_link {name}"));
        let _ = self.links.lock().unwrap().remove(name);
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: &str) -> Result<()> {
        self.record(format!("set_mtu {name} {mtu}"));
        Ok(())
    }

    fn set_hwaddr(&self, name: &str, hwaddr: &str) -> Result<()> {
        self.record(format!("set_hwaddr {name} {hwaddr}"));
        Ok(())
    }

    fn link_properties(&self, _name: &str) -> (Option<String>, Option<String>) {
        (Some("1500".into()), Some("00:16:3e:aa:bb:cc".into()))
    }

    fn set_limits(&self, host_name: &str, ingress: &str, egress: &str) -> Result<()> {
        self.record(format!("set_limits {host_name} {ingress} {egress}"));
        Ok(())
    }

    fn add_routes(&self, dev: &str, routes: &[&str]) -> Result<()> {
        self.record(format!("add_routes {dev} {}", routes.join(",")));
        Ok(())
    }

    fn remove_routes(&self, dev: &str, routes: &[&str]) {
        self.record(format!("remove_routes {dev} {}", routes.join(",")));
    }

    fn add_mac_filter(&self, dev: &str, hwaddr: &str) -> Result<()> {
        self.record(format!("add_mac_filter {dev} {hwaddr}"));
        Ok(())
    }

    fn remove_mac_filter(&self, dev: &str, hwaddr: &str) {
        self.record(format!("remove_mac_filter {dev} {hwaddr}"));
    }

    fn add_nat(&self, rule: &NatRule) -> Result<()> {
        self.record(format!("add_nat {}", rule.owner));
        Ok(())
    }

    fn remove_nat(&self, owner: &str) {
        self.record(format!("remove_nat {owner}"));
    }

    fn clear_leases(&self, network: &str, container: &str, hwaddr: &str) -> Result<()> {
        self.record(format!("clear_leases {network} {container} {hwaddr}"));
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// Base of the host's subordinate id range.
pub const HOST_BASE: i64 = 1_000_000;

/// An engine wired to the fakes above in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub engine: Engine,
    pub runtime: Arc<FakeRuntime>,
    pub storage: Arc<CountingStorage>,
    pub network: Arc<RecordingNetwork>,
    pub events: Arc<EventRecorder>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_driver(|_| {})
    }

    pub fn with_driver(adjust: impl FnOnce(&mut DriverConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut driver = DriverConfig::rooted_at(dir.path());
        driver.operation_timeout_ms = 2_000;
        driver.state_probe_timeout_ms = 1_000;
        driver.freeze_timeout_ms = 200;
        adjust(&mut driver);

        let runtime = Arc::new(FakeRuntime::default());
        let storage = Arc::new(CountingStorage::new(&driver.data_dir));
        let network = Arc::new(RecordingNetwork::default());
        let events = Arc::new(EventRecorder::new());
        let store = Arc::new(MemoryStore::new());

        let mut default = Profile::new("default");
        let _ = default.devices.insert(
            "root",
            Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default")]),
        );
        store.put_profile(&default).expect("default profile");

        let collaborators = Collaborators {
            runtime: Arc::clone(&runtime) as Arc<dyn RuntimeLibrary>,
            storage: Arc::clone(&storage) as Arc<dyn StorageDriver>,
            store: Arc::clone(&store) as Arc<dyn ConfigStore>,
            events: Arc::clone(&events) as _,
            security: Arc::new(Unconfined),
            network: Arc::clone(&network) as Arc<dyn NetworkPlumbing>,
        };
        let host = IdmapSet::contiguous(HOST_BASE, 1_000_000_000);
        let services: Arc<Services> = Services::new(driver, collaborators, host);
        Self {
            dir,
            engine: Engine::new(services),
            runtime,
            storage,
            network,
            events,
            store,
        }
    }
}

/// A config map from literal pairs.
pub fn config(pairs: &[(&str, &str)]) -> corral_common::types::ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// A bridged nic on [`BRIDGE`] with the given host-side name.
pub fn bridged_nic(host_name: &str) -> Device {
    Device::from_pairs([
        ("type", "nic"),
        ("nictype", "bridged"),
        ("parent", BRIDGE),
        ("name", "eth0"),
        ("host_name", host_name),
    ])
}

/// Devices holding only `eth0`.
pub fn with_nic(device: Device) -> Devices {
    let mut devices = Devices::new();
    let _ = devices.insert("eth0", device);
    devices
}

/// Polls `check` until it holds or two seconds pass.
pub fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
