//! Renaming containers and snapshots.

use corral_common::constants::SNAPSHOT_DELIMITER;
use corral_common::error::{CorralError, Result};
use corral_common::types::valid_hostname;

use super::Container;
use crate::events::LifecycleEvent;
use crate::logs;

impl Container {
    /// Renames a stopped container along with its snapshots, volume and log
    /// directory. For a snapshot, `new_name` is the new snapshot name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid name, an invalid-state
    /// error when the container runs, or the storage or store failure.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        let old = self.name();
        let renamed = self.rename_inner(new_name).map_err(|e| e.in_lifecycle("rename", &old))?;
        self.write().record.name.clone_from(&renamed);
        self.release_handle();
        self.services.rekey(&old, &renamed);
        tracing::info!(container = %old, new_name = %renamed, "container renamed");
        self.services
            .emit(LifecycleEvent::new("container-renamed", &old).with("new_name", renamed));
        Ok(())
    }

    fn rename_inner(&self, new_name: &str) -> Result<String> {
        let services = &self.services;
        let old = self.name();
        if let Some((parent, _)) = old.split_once(SNAPSHOT_DELIMITER) {
            if new_name.is_empty() || new_name.contains(SNAPSHOT_DELIMITER) {
                return Err(CorralError::validation(format!("invalid snapshot name: {new_name:?}")));
            }
            let full = format!("{parent}{SNAPSHOT_DELIMITER}{new_name}");
            services.storage.rename(&old, &full)?;
            services.store.rename_container(&old, &full)?;
            return Ok(full);
        }

        if !valid_hostname(new_name) {
            return Err(CorralError::validation(format!("invalid container name: {new_name}")));
        }
        if self.is_running() {
            return Err(CorralError::invalid_state("renaming of running container not allowed"));
        }
        let snapshots = services.store.snapshots(&old)?;

        self.remove_host_state();
        logs::rename_dir(&services.driver.log_dir, &old, new_name)?;
        services.storage.rename(&old, new_name)?;
        for snapshot in &snapshots {
            let Some((_, short)) = snapshot.name.split_once(SNAPSHOT_DELIMITER) else {
                continue;
            };
            services
                .storage
                .rename(&snapshot.name, &format!("{new_name}{SNAPSHOT_DELIMITER}{short}"))?;
        }

        services.store.rename_container(&old, new_name)?;
        for snapshot in &snapshots {
            let Some((_, short)) = snapshot.name.split_once(SNAPSHOT_DELIMITER) else {
                continue;
            };
            services
                .store
                .rename_container(&snapshot.name, &format!("{new_name}{SNAPSHOT_DELIMITER}{short}"))?;
            services.forget(&snapshot.name);
        }
        Ok(new_name.to_string())
    }
}
