//! Host services shared by every container, and the entry points that do
//! not start from an already loaded container.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use corral_common::config::DriverConfig;
use corral_common::constants::{SUBGID_PATH, SUBUID_PATH, keys};
use corral_common::device::{Device, Devices};
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfigMap, valid_hostname};
use corral_core::idmap::IdmapSet;
use corral_core::idmap::host::host_idmap;

use crate::backend::{LifecycleHooks, RuntimeLibrary, detect_backend};
use crate::container::Container;
use crate::device::hotplug::HotplugWatcher;
use crate::events::{EventSink, LifecycleEvent, LogSink};
use crate::expand::{Profile, expand_config, expand_devices};
use crate::idmap::IdmapAllocator;
use crate::network::{HostNetwork, NetworkPlumbing};
use crate::operation::OperationRegistry;
use crate::security::{SecurityProfiles, Unconfined};
use crate::storage::{DirStorage, StorageDriver};
use crate::store::{ConfigStore, ContainerRecord, JsonFileStore};
use crate::validate::{validate_config, validate_devices, validate_profiles};

/// External collaborators the lifecycle drives.
pub struct Collaborators {
    /// Runtime library creating container handles.
    pub runtime: Arc<dyn RuntimeLibrary>,
    /// Storage layer holding volumes.
    pub storage: Arc<dyn StorageDriver>,
    /// Persistent records.
    pub store: Arc<dyn ConfigStore>,
    /// Lifecycle notifications.
    pub events: Arc<dyn EventSink>,
    /// Security profile loader.
    pub security: Arc<dyn SecurityProfiles>,
    /// Host network plumbing.
    pub network: Arc<dyn NetworkPlumbing>,
}

/// Everything a container needs from the host, shared by all containers.
pub struct Services {
    /// Host configuration.
    pub driver: DriverConfig,
    /// Runtime library.
    pub runtime: Arc<dyn RuntimeLibrary>,
    /// Storage layer.
    pub storage: Arc<dyn StorageDriver>,
    /// Persistent records.
    pub store: Arc<dyn ConfigStore>,
    /// Lifecycle notifications.
    pub events: Arc<dyn EventSink>,
    /// Security profiles.
    pub security: Arc<dyn SecurityProfiles>,
    /// Host network plumbing.
    pub network: Arc<dyn NetworkPlumbing>,
    /// Per-container operation locks.
    pub operations: OperationRegistry,
    /// Host-wide idmap allocator.
    pub idmap: IdmapAllocator,
    /// Watches for optional devices whose source is missing.
    pub hotplug: HotplugWatcher,
    // One live instance per container name.
    instances: Mutex<HashMap<String, Weak<Container>>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("driver", &self.driver)
            .field("operations", &self.operations)
            .field("idmap", &self.idmap)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Wires `collaborators` together with fresh registries.
    #[must_use]
    pub fn new(driver: DriverConfig, collaborators: Collaborators, host_idmap: IdmapSet) -> Arc<Self> {
        Arc::new(Self {
            operations: OperationRegistry::new(driver.operation_timeout()),
            idmap: IdmapAllocator::new(host_idmap).with_lock_file(&driver.data_dir.join("idmap.lock")),
            hotplug: HotplugWatcher::new(),
            runtime: collaborators.runtime,
            storage: collaborators.storage,
            store: collaborators.store,
            events: collaborators.events,
            security: collaborators.security,
            network: collaborators.network,
            instances: Mutex::new(HashMap::new()),
            driver,
        })
    }

    /// Services backed by the host: LXC tools, directory volumes, the JSON
    /// store under `data_dir` and the `root` sub-id ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the sub-id files
    /// are malformed.
    pub fn host(driver: DriverConfig) -> Result<Arc<Self>> {
        let store = JsonFileStore::open(&driver.store_path())?;
        ensure_default_profile(&store)?;
        let collaborators = Collaborators {
            runtime: detect_backend(&driver.containers_dir(), &driver.log_dir),
            storage: Arc::new(DirStorage::new("default", &driver.data_dir)),
            store: Arc::new(store),
            events: Arc::new(LogSink),
            security: Arc::new(Unconfined),
            network: Arc::new(HostNetwork::new(&driver.sysfs_root, &driver.data_dir)),
        };
        let host = host_idmap(Path::new(SUBUID_PATH), Path::new(SUBGID_PATH), "root")?;
        Ok(Self::new(driver, collaborators, host))
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Weak<Container>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emits a lifecycle event.
    pub fn emit(&self, event: LifecycleEvent) {
        self.events.emit(event);
    }

    pub(crate) fn forget(&self, name: &str) {
        let _ = self.instances().remove(name);
    }

    pub(crate) fn rekey(&self, old: &str, new: &str) {
        let mut instances = self.instances();
        if let Some(instance) = instances.remove(old) {
            let _ = instances.insert(new.to_string(), instance);
        }
    }
}

/// Loads `name`, returning the live instance when one exists.
///
/// # Errors
///
/// Returns [`CorralError::NotFound`] for unknown containers or profiles.
pub fn load_container(services: &Arc<Services>, name: &str) -> Result<Arc<Container>> {
    if let Some(live) = services.instances().get(name).and_then(Weak::upgrade) {
        return Ok(live);
    }
    let record = services.store.container(name)?;
    let profiles = services.store.resolve_profiles(&record.profiles)?;
    let container = Container::new(Arc::clone(services), record, profiles);
    let mut instances = services.instances();
    // Another thread may have loaded it meanwhile.
    if let Some(live) = instances.get(name).and_then(Weak::upgrade) {
        return Ok(live);
    }
    let _ = instances.insert(name.to_string(), Arc::downgrade(&container));
    Ok(container)
}

/// Makes sure the `default` profile exists and carries a root disk on the
/// default pool.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn ensure_default_profile(store: &dyn ConfigStore) -> Result<()> {
    let mut profile = match store.profile("default") {
        Ok(profile) => profile,
        Err(CorralError::NotFound { .. }) => {
            let mut profile = Profile::new("default");
            profile.description = "Default profile".into();
            profile
        }
        Err(e) => return Err(e),
    };
    if profile.devices.iter().any(|(_, device)| device.is_root_disk()) {
        return Ok(());
    }
    let _ = profile.devices.insert(
        "root",
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    tracing::info!("root disk added to the default profile");
    store.put_profile(&profile)
}

/// Parameters of a new container.
#[derive(Debug, Clone)]
pub struct CreateArgs {
    /// Container name, a valid hostname.
    pub name: String,
    /// Profiles applied in order.
    pub profiles: Vec<String>,
    /// Local configuration keys.
    pub config: ConfigMap,
    /// Local devices.
    pub devices: Devices,
    /// Delete the container when it stops.
    pub ephemeral: bool,
    /// Free-form description.
    pub description: String,
}

impl CreateArgs {
    /// Arguments for `name` with the default profile.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profiles: vec!["default".into()],
            config: ConfigMap::new(),
            devices: Devices::new(),
            ephemeral: false,
            description: String::new(),
        }
    }
}

/// A lifecycle hook as invoked by the runtime library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    /// Before the container's init runs.
    Start,
    /// While the network namespace is still alive during stop.
    StopNs {
        /// `stop` or `reboot`.
        target: String,
        /// Path of the network namespace.
        netns: String,
    },
    /// After the container stopped.
    Stop {
        /// `stop` or `reboot`.
        target: String,
    },
    /// A network device is up on the host.
    NetworkUp {
        /// Device name.
        device: String,
        /// Host-side interface name.
        host_name: String,
    },
}

/// Entry point of the driver.
#[derive(Debug, Clone)]
pub struct Engine {
    services: Arc<Services>,
}

impl Engine {
    /// Creates an engine over `services`.
    #[must_use]
    pub const fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Creates an engine backed by the host.
    ///
    /// # Errors
    ///
    /// See [`Services::host`].
    pub fn open(driver: DriverConfig) -> Result<Self> {
        Ok(Self::new(Services::host(driver)?))
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Loads a container or snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for unknown containers.
    pub fn load(&self, name: &str) -> Result<Arc<Container>> {
        load_container(&self.services, name)
    }

    /// Every container, snapshots excluded, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list(&self) -> Result<Vec<Arc<Container>>> {
        let mut records = self.services.store.containers()?;
        records.retain(|r| !r.is_snapshot());
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records.iter().map(|r| self.load(&r.name)).collect()
    }

    /// Creates a stopped container: validates it, records it, allocates its
    /// idmap and provisions its storage volume.
    ///
    /// # Errors
    ///
    /// Returns a validation error before anything is recorded, or the
    /// allocation or storage failure after rolling the record back.
    pub fn create(&self, args: CreateArgs) -> Result<Arc<Container>> {
        let name = args.name.clone();
        self.create_inner(args).map_err(|e| e.in_lifecycle("create", &name))
    }

    fn create_inner(&self, args: CreateArgs) -> Result<Arc<Container>> {
        let services = &self.services;
        if !valid_hostname(&args.name) {
            return Err(CorralError::validation(format!("invalid container name: {}", args.name)));
        }
        validate_profiles(&args.profiles)?;
        let profiles = services.store.resolve_profiles(&args.profiles)?;
        validate_config(&args.config)?;
        validate_devices(&args.devices, false)?;
        let expanded_config = expand_config(&args.config, &profiles);
        validate_config(&expanded_config)?;
        validate_devices(&expand_devices(&args.devices, &profiles), true)?;

        let mut record = ContainerRecord::new(args.name.as_str());
        record.profiles = args.profiles;
        record.config = args.config;
        record.devices = args.devices;
        record.ephemeral = args.ephemeral;
        record.description = args.description;
        let id = services.store.create_container(&record)?;
        tracing::debug!(container = %record.name, %id, "container recorded");

        if let Err(e) = self.provision(&record.name, &expanded_config) {
            let rollback = services
                .store
                .delete_container(&record.name)
                .and_then(|()| services.storage.delete(&record.name))
                .err();
            return Err(e.with_rollback(rollback));
        }

        tracing::info!(container = %record.name, ephemeral = record.ephemeral, "container created");
        services.emit(LifecycleEvent::new("container-created", &record.name));
        self.load(&record.name)
    }

    fn provision(&self, name: &str, expanded_config: &ConfigMap) -> Result<()> {
        let services = &self.services;
        {
            let allocation = services.idmap.allocate(services.store.as_ref(), name, expanded_config)?;
            let mut changes = allocation.volatile_changes()?;
            changes.push((keys::VOLATILE_LAST_STATE_IDMAP.to_string(), Some("[]".to_string())));
            services.store.update_config(name, &changes)?;
        }
        services.storage.create(name)
    }

    /// Takes a snapshot of `name`. Stateful snapshots also checkpoint the
    /// running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the storage or checkpoint
    /// step fails.
    pub fn snapshot(&self, name: &str, snapshot: &str, stateful: bool) -> Result<Arc<Container>> {
        self.load(name)?.snapshot(snapshot, stateful)
    }

    /// Deletes a stopped container with its snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is running or protected.
    pub fn delete(&self, name: &str) -> Result<()> {
        let container = self.load(name)?;
        if !container.is_snapshot() && container.is_running() {
            return Err(CorralError::invalid_state("the container is running").in_lifecycle("delete", name));
        }
        container.delete()
    }

    /// Runs a lifecycle hook on behalf of the runtime library.
    ///
    /// # Errors
    ///
    /// Returns the hook's failure; the runtime library aborts the
    /// transition on error.
    pub fn callhook(&self, name: &str, hook: &Hook) -> Result<()> {
        let container = self.load(name)?;
        tracing::debug!(container = name, ?hook, "running hook");
        match hook {
            Hook::Start => container.on_start(),
            Hook::StopNs { target, netns } => container.on_stop_ns(target, netns),
            Hook::Stop { target } => container.on_stop(target),
            Hook::NetworkUp { device, host_name } => container.on_network_up(device, host_name),
        }
    }
}
