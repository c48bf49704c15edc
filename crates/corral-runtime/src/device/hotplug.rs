//! Deferred attachment of optional devices whose source is missing.
//!
//! A registration watches the closest existing ancestor of the missing
//! path with inotify. Whenever something appears below a watched
//! directory, registrations whose path now exists fire their callback
//! once and are dropped; the others re-arm on the new closest ancestor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use corral_common::error::Result;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Registration {
    target: PathBuf,
    callback: Callback,
}

#[derive(Default)]
struct Registrations {
    // Keyed by (container, device).
    entries: HashMap<(String, String), Registration>,
}

/// Watches missing device sources and fires callbacks when they appear.
#[derive(Clone, Default)]
pub struct HotplugWatcher {
    registrations: Arc<Mutex<Registrations>>,
    #[cfg(target_os = "linux")]
    inotify: Arc<OnceLock<Option<Arc<nix::sys::inotify::Inotify>>>>,
    #[cfg(not(target_os = "linux"))]
    inotify: Arc<OnceLock<Option<()>>>,
}

impl std::fmt::Debug for HotplugWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugWatcher")
            .field("pending", &self.lock().entries.len())
            .finish_non_exhaustive()
    }
}

/// Closest existing ancestor of `path`.
#[must_use]
pub fn closest_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

impl HotplugWatcher {
    /// Creates a watcher. The inotify thread starts with the first
    /// registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls `callback` once `target` exists. Replaces an earlier
    /// registration of the same device.
    ///
    /// # Errors
    ///
    /// Returns an error if no ancestor of `target` can be watched.
    pub fn register(
        &self,
        container: &str,
        device: &str,
        target: &Path,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        self.arm(target)?;
        let _ = self.lock().entries.insert(
            (container.to_string(), device.to_string()),
            Registration {
                target: target.to_path_buf(),
                callback: Box::new(callback),
            },
        );
        tracing::debug!(container, device, target = %target.display(), "hotplug watch registered");
        Ok(())
    }

    /// Drops the registration of one device.
    pub fn unregister(&self, container: &str, device: &str) {
        let _ = self
            .lock()
            .entries
            .remove(&(container.to_string(), device.to_string()));
    }

    /// Drops every registration of a container.
    pub fn unregister_container(&self, container: &str) {
        self.lock().entries.retain(|(c, _), _| c != container);
    }

    /// Devices of `container` still waiting for their source.
    #[must_use]
    pub fn pending(&self, container: &str) -> Vec<String> {
        let mut devices: Vec<String> = self
            .lock()
            .entries
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, d)| d.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Fires the callbacks of registrations whose target exists and
    /// returns how many fired. Callbacks run without the registry lock.
    pub fn poll(&self) -> usize {
        let ready: Vec<((String, String), Registration)> = {
            let mut registrations = self.lock();
            let keys: Vec<(String, String)> = registrations
                .entries
                .iter()
                .filter(|(_, r)| r.target.exists())
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| registrations.entries.remove(&k).map(|r| (k, r)))
                .collect()
        };
        for ((container, device), registration) in &ready {
            tracing::info!(container, device, target = %registration.target.display(), "device source appeared");
            (registration.callback)();
        }
        let waiting: Vec<PathBuf> = self.lock().entries.values().map(|r| r.target.clone()).collect();
        for target in waiting {
            if let Err(e) = self.arm(&target) {
                tracing::warn!(target = %target.display(), error = %e, "failed to re-arm hotplug watch");
            }
        }
        ready.len()
    }

    #[cfg(target_os = "linux")]
    fn arm(&self, target: &Path) -> Result<()> {
        use corral_common::error::CorralError;
        use nix::sys::inotify::AddWatchFlags;

        let Some(dir) = closest_ancestor(target) else {
            return Err(CorralError::validation(format!(
                "no existing ancestor of {}",
                target.display()
            )));
        };
        let Some(inotify) = self.inotify.get_or_init(|| self.start()).clone() else {
            return Err(CorralError::external("hotplug", "inotify is unavailable"));
        };
        let _ = inotify
            .add_watch(&dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
            .map_err(|e| CorralError::external(format!("failed to watch {}", dir.display()), e))?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn start(&self) -> Option<Arc<nix::sys::inotify::Inotify>> {
        use nix::sys::inotify::{InitFlags, Inotify};

        let inotify = match Inotify::init(InitFlags::IN_CLOEXEC) {
            Ok(inotify) => Arc::new(inotify),
            Err(e) => {
                tracing::error!(error = %e, "failed to initialise inotify");
                return None;
            }
        };
        let reader = Arc::clone(&inotify);
        let watcher = self.clone();
        let spawned = std::thread::Builder::new()
            .name("corral-hotplug".into())
            .spawn(move || {
                loop {
                    match reader.read_events() {
                        Ok(_) => {
                            let _ = watcher.poll();
                        }
                        Err(nix::errno::Errno::EINTR) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "hotplug watcher stopped");
                            return;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start hotplug thread");
            return None;
        }
        Some(inotify)
    }

    #[cfg(not(target_os = "linux"))]
    fn arm(&self, _target: &Path) -> Result<()> {
        let _ = self.inotify.get_or_init(|| None);
        Ok(())
    }
}
