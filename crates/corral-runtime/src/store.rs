//! Persistent container and profile records.
//!
//! Records live in a single JSON document per host. Every mutation is one
//! transaction: the document is loaded, changed and written back through a
//! temporary file and a rename, so readers never observe a partial write.
//! Transactions hold a `flock` on a sibling lock file, which serializes
//! them across `corralctl` processes and runtime hooks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use corral_common::device::Devices;
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfigMap, ContainerId, PowerState};
use corral_core::filesystem::lock::FileLock;
use serde::{Deserialize, Serialize};

use crate::expand::Profile;

/// Persistent record of a container or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Database id.
    pub id: ContainerId,
    /// Owning project.
    pub project: String,
    /// Name; snapshots are named `<parent>/<snapshot>`.
    pub name: String,
    /// Host the container lives on.
    pub node: String,
    /// Architecture name.
    pub architecture: String,
    /// Deleted when it stops.
    pub ephemeral: bool,
    /// A stateful checkpoint is stored on disk.
    pub stateful: bool,
    /// Free-form description.
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last start time.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Snapshot expiry.
    pub expiry_date: Option<DateTime<Utc>>,
    /// Profiles applied in order.
    pub profiles: Vec<String>,
    /// Local configuration keys.
    pub config: ConfigMap,
    /// Local devices.
    pub devices: Devices,
    /// Power state recorded by the lifecycle hooks.
    #[serde(default)]
    pub power_state: PowerState,
}

impl ContainerRecord {
    /// A fresh record with default profile and no configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ContainerId::new(0),
            project: "default".into(),
            name: name.into(),
            node: String::new(),
            architecture: std::env::consts::ARCH.into(),
            ephemeral: false,
            stateful: false,
            description: String::new(),
            created_at: Utc::now(),
            last_used_at: None,
            expiry_date: None,
            profiles: vec!["default".into()],
            config: ConfigMap::new(),
            devices: Devices::new(),
            power_state: PowerState::Stopped,
        }
    }

    /// Whether this record is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.name.contains(corral_common::constants::SNAPSHOT_DELIMITER)
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreData {
    next_id: u64,
    containers: BTreeMap<String, ContainerRecord>,
    profiles: BTreeMap<String, Profile>,
}

fn not_found(kind: &'static str, id: &str) -> CorralError {
    CorralError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl StoreData {
    fn container(&self, name: &str) -> Result<ContainerRecord> {
        self.containers
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("container", name))
    }

    fn create_container(&mut self, record: &ContainerRecord) -> Result<ContainerId> {
        if self.containers.contains_key(&record.name) {
            return Err(CorralError::validation(format!(
                "container {} already exists",
                record.name
            )));
        }
        self.next_id += 1;
        let id = ContainerId::new(self.next_id);
        let mut record = record.clone();
        record.id = id;
        let _ = self.containers.insert(record.name.clone(), record);
        Ok(id)
    }

    fn update_container(&mut self, record: &ContainerRecord) -> Result<()> {
        let slot = self
            .containers
            .get_mut(&record.name)
            .ok_or_else(|| not_found("container", &record.name))?;
        *slot = record.clone();
        Ok(())
    }

    fn update_config(&mut self, name: &str, changes: &[(String, Option<String>)]) -> Result<()> {
        let record = self
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found("container", name))?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    let _ = record.config.insert(key.clone(), value.clone());
                }
                None => {
                    let _ = record.config.remove(key);
                }
            }
        }
        Ok(())
    }

    fn rename_container(&mut self, old: &str, new: &str) -> Result<()> {
        if self.containers.contains_key(new) {
            return Err(CorralError::validation(format!("name {new} is already in use")));
        }
        let mut record = self
            .containers
            .remove(old)
            .ok_or_else(|| not_found("container", old))?;
        record.name = new.to_string();
        let _ = self.containers.insert(new.to_string(), record);
        Ok(())
    }

    fn delete_container(&mut self, name: &str) -> Result<()> {
        self.containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("container", name))
    }
}

/// Transactional key/value storage for container and profile records.
pub trait ConfigStore: Send + Sync {
    /// Returns one container record.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] when no such container exists.
    fn container(&self, name: &str) -> Result<ContainerRecord>;

    /// Returns every container and snapshot record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Inserts a new record and assigns its id.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the name is taken.
    fn create_container(&self, record: &ContainerRecord) -> Result<ContainerId>;

    /// Replaces an existing record in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] when no such container exists.
    fn update_container(&self, record: &ContainerRecord) -> Result<()>;

    /// Sets (`Some`) or removes (`None`) local configuration keys.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] when no such container exists.
    fn update_config(&self, name: &str, changes: &[(String, Option<String>)]) -> Result<()>;

    /// Renames a record.
    ///
    /// # Errors
    ///
    /// Returns an error when `old` is missing or `new` is taken.
    fn rename_container(&self, old: &str, new: &str) -> Result<()>;

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] when no such container exists.
    fn delete_container(&self, name: &str) -> Result<()>;

    /// Returns one profile.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] when no such profile exists.
    fn profile(&self, name: &str) -> Result<Profile>;

    /// Inserts or replaces a profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn put_profile(&self, profile: &Profile) -> Result<()>;

    /// Resolves profile names in order.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] naming the first missing profile.
    fn resolve_profiles(&self, names: &[String]) -> Result<Vec<Profile>> {
        names.iter().map(|name| self.profile(name)).collect()
    }

    /// Snapshots of `parent`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn snapshots(&self, parent: &str) -> Result<Vec<ContainerRecord>> {
        let prefix = format!("{parent}{}", corral_common::constants::SNAPSHOT_DELIMITER);
        Ok(self
            .containers()?
            .into_iter()
            .filter(|r| r.name.starts_with(&prefix))
            .collect())
    }
}

/// Runs a closure against the persisted document.
pub trait Transact: Send + Sync {
    /// Applies `f` to the document. When `write` is set and `f` succeeds the
    /// document is persisted before returning.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f` and from loading or saving the document.
    fn transact<R>(&self, write: bool, f: impl FnOnce(&mut StoreData) -> Result<R>) -> Result<R>;
}

impl<T: Transact> ConfigStore for T {
    fn container(&self, name: &str) -> Result<ContainerRecord> {
        self.transact(false, |d| d.container(name))
    }

    fn containers(&self) -> Result<Vec<ContainerRecord>> {
        self.transact(false, |d| Ok(d.containers.values().cloned().collect()))
    }

    fn create_container(&self, record: &ContainerRecord) -> Result<ContainerId> {
        self.transact(true, |d| d.create_container(record))
    }

    fn update_container(&self, record: &ContainerRecord) -> Result<()> {
        self.transact(true, |d| d.update_container(record))
    }

    fn update_config(&self, name: &str, changes: &[(String, Option<String>)]) -> Result<()> {
        self.transact(true, |d| d.update_config(name, changes))
    }

    fn rename_container(&self, old: &str, new: &str) -> Result<()> {
        self.transact(true, |d| d.rename_container(old, new))
    }

    fn delete_container(&self, name: &str) -> Result<()> {
        self.transact(true, |d| d.delete_container(name))
    }

    fn profile(&self, name: &str) -> Result<Profile> {
        self.transact(false, |d| {
            d.profiles
                .get(name)
                .cloned()
                .ok_or_else(|| not_found("profile", name))
        })
    }

    fn put_profile(&self, profile: &Profile) -> Result<()> {
        self.transact(true, |d| {
            let _ = d.profiles.insert(profile.name.clone(), profile.clone());
            Ok(())
        })
    }
}

/// Store backed by a JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store at `path`. The document is created on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CorralError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    /// The `flock` file serializing transactions across processes.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreData> {
        if !self.path.exists() {
            return Ok(StoreData::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| CorralError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(StoreData::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CorralError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(data)?;
        std::fs::write(&tmp, json).map_err(|e| CorralError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CorralError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %self.path.display(), "store saved");
        Ok(())
    }
}

impl Transact for JsonFileStore {
    fn transact<R>(&self, write: bool, f: impl FnOnce(&mut StoreData) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file = if write {
            FileLock::exclusive(&self.lock_path())?
        } else {
            FileLock::shared(&self.lock_path())?
        };
        let mut data = self.load()?;
        let result = f(&mut data)?;
        if write {
            self.save(&data)?;
        }
        Ok(result)
    }
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    /// Creates a store holding only an empty `default` profile.
    #[must_use]
    pub fn new() -> Self {
        let mut data = StoreData::default();
        let _ = data
            .profiles
            .insert("default".into(), Profile::new("default"));
        Self {
            data: Mutex::new(data),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Transact for MemoryStore {
    fn transact<R>(&self, _write: bool, f: impl FnOnce(&mut StoreData) -> Result<R>) -> Result<R> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        // Work on a copy so a failed transaction leaves nothing behind.
        let mut draft = data.clone();
        let result = f(&mut draft)?;
        *data = draft;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        {
            let store = JsonFileStore::open(&path).expect("open");
            let mut record = ContainerRecord::new("c1");
            let _ = record.config.insert("limits.cpu".into(), "2".into());
            let id = store.create_container(&record).expect("create");
            assert_eq!(id.get(), 1);
        }
        let store = JsonFileStore::open(&path).expect("reopen");
        let record = store.container("c1").expect("c1");
        assert_eq!(record.config["limits.cpu"], "2");
        assert!(!dir.path().join("store.json.tmp").exists());
    }

    #[test]
    fn opening_a_fresh_store_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db/store.json");
        let store = JsonFileStore::open(&path).expect("open");
        assert!(!path.exists());
        assert!(matches!(
            store.profile("default"),
            Err(CorralError::NotFound { .. })
        ));
    }

    #[test]
    fn separate_handles_do_not_lose_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let _ = JsonFileStore::open(&path)
            .expect("open")
            .create_container(&ContainerRecord::new("c1"))
            .expect("create");

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = JsonFileStore::open(&path).expect("open");
                    for i in 0..20 {
                        let key = format!("user.w{writer}.k{i}");
                        store
                            .update_config("c1", &[(key, Some("1".into()))])
                            .expect("update");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("join");
        }

        let record = JsonFileStore::open(&path).expect("open").container("c1").expect("c1");
        let written = record.config.keys().filter(|k| k.starts_with("user.w")).count();
        assert_eq!(written, 40);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let store = MemoryStore::new();
        let _ = store.create_container(&ContainerRecord::new("c1")).expect("create");
        assert!(store.create_container(&ContainerRecord::new("c1")).is_err());
    }

    #[test]
    fn config_changes_set_and_remove_keys() {
        let store = MemoryStore::new();
        let mut record = ContainerRecord::new("c1");
        let _ = record.config.insert("volatile.eth0.name".into(), "eth0".into());
        let _ = store.create_container(&record).expect("create");

        store
            .update_config(
                "c1",
                &[
                    ("volatile.idmap.base".into(), Some("1065536".into())),
                    ("volatile.eth0.name".into(), None),
                ],
            )
            .expect("update");
        let record = store.container("c1").expect("c1");
        assert_eq!(record.config.get("volatile.idmap.base").map(String::as_str), Some("1065536"));
        assert!(!record.config.contains_key("volatile.eth0.name"));
    }

    #[test]
    fn failed_transactions_leave_no_trace() {
        let store = MemoryStore::new();
        let _ = store.create_container(&ContainerRecord::new("a")).expect("a");
        let _ = store.create_container(&ContainerRecord::new("b")).expect("b");
        assert!(store.rename_container("a", "b").is_err());
        assert!(store.container("a").is_ok());
    }

    #[test]
    fn snapshots_are_listed_by_prefix() {
        let store = MemoryStore::new();
        for name in ["web", "web/snap0", "web/snap1", "webby"] {
            let _ = store.create_container(&ContainerRecord::new(name)).expect("create");
        }
        let snaps: Vec<String> = store
            .snapshots("web")
            .expect("snapshots")
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(snaps, vec!["web/snap0", "web/snap1"]);
        assert!(ContainerRecord::new("web/snap0").is_snapshot());
    }

    #[test]
    fn missing_profiles_are_reported() {
        let store = MemoryStore::new();
        let err = store
            .resolve_profiles(&["default".into(), "gpu".into()])
            .unwrap_err();
        assert!(err.to_string().contains("gpu"));
    }
}
