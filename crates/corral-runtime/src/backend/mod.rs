//! Runtime library abstraction.
//!
//! The driver never creates namespaces or cgroups itself: it configures a
//! low-level runtime library through key/value items and drives it through
//! a small set of primitives. The library calls back into the driver
//! through [`LifecycleHooks`] at fixed points of a container's life.

pub mod lxc;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use corral_common::error::Result;
use corral_common::types::StatusCode;

/// Callbacks the runtime library invokes while a container starts and stops.
pub trait LifecycleHooks: Send + Sync {
    /// Runs before the container's init, once the namespaces exist.
    ///
    /// # Errors
    ///
    /// Returns an error to abort the start.
    fn on_start(&self) -> Result<()>;

    /// Runs while the network namespace still exists during a stop.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid target.
    fn on_stop_ns(&self, target: &str, netns: &str) -> Result<()>;

    /// Runs after the container stopped. `target` is `stop` or `reboot`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid target or a conflicting operation.
    fn on_stop(&self, target: &str) -> Result<()>;

    /// Runs once a network device is up on the host side.
    ///
    /// # Errors
    ///
    /// Returns an error if host-side limits or routes cannot be applied.
    fn on_network_up(&self, device: &str, host_name: &str) -> Result<()>;
}

/// Checkpoint tool actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateCommand {
    /// Write the process state to disk.
    Dump,
    /// Revive a container from a dump.
    Restore,
}

/// Options for [`RuntimeHandle::migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Directory holding the checkpoint images.
    pub directory: PathBuf,
    /// Stop the container once dumped.
    pub stop: bool,
    /// Ask the tool for verbose logs.
    pub verbose: bool,
}

/// One runtime library object bound to a container.
pub trait RuntimeHandle: Send + Sync {
    /// Appends one low-level configuration item. Repeated keys accumulate.
    ///
    /// # Errors
    ///
    /// Returns an error for keys the library rejects.
    fn set_config_item(&self, key: &str, value: &str) -> Result<()>;

    /// Values of a configuration item, in insertion order.
    fn config_item(&self, key: &str) -> Vec<String>;

    /// Writes the accumulated configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save_config_file(&self, path: &Path) -> Result<()>;

    /// Starts the container from the saved configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the container fails to start.
    fn start(&self, config_path: &Path) -> Result<()>;

    /// Kills the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container could not be stopped.
    fn stop(&self) -> Result<()>;

    /// Asks the container's init to shut down, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is still running afterwards.
    fn shutdown(&self, timeout: Duration) -> Result<()>;

    /// Freezes every process of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer refuses.
    fn freeze(&self) -> Result<()>;

    /// Thaws a frozen container.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer refuses.
    fn unfreeze(&self) -> Result<()>;

    /// Current state as reported by the library's monitor.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor cannot be queried.
    fn state(&self) -> Result<StatusCode>;

    /// Pid of the container's init on the host, when running.
    fn init_pid(&self) -> Option<u32>;

    /// Runs the checkpoint tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the dump or restore fails.
    fn migrate(&self, command: MigrateCommand, options: &MigrateOptions) -> Result<()>;

    /// Moves a host interface into the container, renaming it.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be moved.
    fn attach_interface(&self, host_name: &str, container_name: &str) -> Result<()>;

    /// Moves an interface out of the container, renaming it on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be moved.
    fn detach_interface(&self, container_name: &str, host_name: &str) -> Result<()>;

    /// Reads a cgroup value of the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller or key is missing.
    fn cgroup_item(&self, key: &str) -> Result<String>;

    /// Writes a cgroup value of the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the value.
    fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()>;

    /// Mounts a host path at `target` inside the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount cannot be inserted.
    fn insert_mount(&self, source: &Path, target: &str, readonly: bool) -> Result<()>;

    /// Unmounts `target` inside the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount fails.
    fn remove_mount(&self, target: &str) -> Result<()>;
}

/// Factory for runtime handles.
pub trait RuntimeLibrary: Send + Sync {
    /// Creates a fresh handle for `container`. `hooks` is called back at
    /// lifecycle points when the library runs hooks in this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the library cannot allocate the object.
    fn new_handle(
        &self,
        container: &str,
        hooks: Weak<dyn LifecycleHooks>,
    ) -> Result<Arc<dyn RuntimeHandle>>;

    /// Whether hooks run inside this process. When they run in a separate
    /// `callhook` process, the stopping caller finishes its own operation.
    fn hooks_in_process(&self) -> bool;

    /// Command the library runs once a network device of `container` is up
    /// on the host, when hooks run out of process.
    fn network_up_hook(&self, _container: &str, _device: &str) -> Option<String> {
        None
    }

    /// Whether the library's tools are installed.
    fn is_available(&self) -> bool;
}

/// Returns the LXC tools backend rooted at `lxcpath`.
#[must_use]
pub fn detect_backend(lxcpath: &Path, log_dir: &Path) -> Arc<dyn RuntimeLibrary> {
    let hook_binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("corralctl"));
    Arc::new(lxc::LxcTools::new(lxcpath, log_dir, &hook_binary))
}
