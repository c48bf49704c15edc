//! Snapshots and restoring from them.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use corral_common::constants::SNAPSHOT_DELIMITER;
use corral_common::error::{CorralError, Result};
use corral_common::types::PowerState;
use corral_core::command::run;

use super::{Container, UpdateArgs, container_path};
use crate::backend::{MigrateCommand, MigrateOptions};
use crate::engine::load_container;
use crate::events::LifecycleEvent;

fn criu_available() -> bool {
    which::which("criu").is_ok()
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target).map_err(|e| CorralError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    let from = format!("{}/.", source.display());
    let to = target.to_string_lossy();
    let _ = run("cp", &["-a", from.as_str(), to.as_ref()])?;
    Ok(())
}

impl Container {
    /// Records a snapshot named `<name>/<snapshot>` and copies the volume.
    /// A stateful snapshot also checkpoints the running container into the
    /// snapshot's state directory.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad name, an invalid-state error for
    /// a stateful snapshot of a stopped container, or the storage or
    /// checkpoint failure after the snapshot was removed again.
    pub fn snapshot(&self, snapshot: &str, stateful: bool) -> Result<Arc<Self>> {
        let name = self.name();
        let created = self
            .snapshot_inner(snapshot, stateful)
            .map_err(|e| e.in_lifecycle("snapshot", &name))?;
        tracing::info!(container = %name, snapshot, stateful, "snapshot created");
        self.services
            .emit(LifecycleEvent::new("container-snapshot-created", &created.name()));
        Ok(created)
    }

    fn snapshot_inner(&self, snapshot: &str, stateful: bool) -> Result<Arc<Self>> {
        let services = &self.services;
        if self.is_snapshot() {
            return Err(CorralError::validation("snapshots cannot be snapshotted"));
        }
        if snapshot.is_empty() || snapshot.contains(SNAPSHOT_DELIMITER) {
            return Err(CorralError::validation(format!("invalid snapshot name: {snapshot:?}")));
        }
        if stateful {
            if !self.is_running() {
                return Err(CorralError::invalid_state(
                    "unable to create a stateful snapshot, the container isn't running",
                ));
            }
            if !criu_available() {
                return Err(CorralError::validation("unable to create a stateful snapshot, criu isn't available"));
            }
        }

        let name = self.name();
        let mut record = self.record();
        record.name = format!("{name}{SNAPSHOT_DELIMITER}{snapshot}");
        record.stateful = stateful;
        record.created_at = Utc::now();
        record.last_used_at = None;
        record.expiry_date = None;
        record.power_state = PowerState::Stopped;
        let _ = services.store.create_container(&record)?;

        let result = services.storage.snapshot(&name, snapshot).and_then(|()| {
            if stateful {
                self.checkpoint_into(&container_path(&services.driver, &record.name).join("state"))
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            let rollback = services
                .storage
                .delete(&record.name)
                .and_then(|()| services.store.delete_container(&record.name))
                .err();
            return Err(e.with_rollback(rollback));
        }
        load_container(services, &record.name)
    }

    /// Dumps the running container into `state` and leaves it running.
    fn checkpoint_into(&self, state: &Path) -> Result<()> {
        if state.exists() {
            std::fs::remove_dir_all(state).map_err(|e| CorralError::Io {
                path: state.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::create_dir_all(state).map_err(|e| CorralError::Io {
            path: state.to_path_buf(),
            source: e,
        })?;
        let options = MigrateOptions {
            directory: state.to_path_buf(),
            stop: false,
            verbose: false,
        };
        self.handle()?.migrate(MigrateCommand::Dump, &options)
    }

    /// Rolls the container back to `source`, one of its snapshots.
    ///
    /// A running container is stopped first and started again afterwards.
    /// With `stateful`, the snapshot's checkpoint is restored instead of a
    /// fresh boot.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `source` is not a snapshot of this
    /// container, or the stop, storage, update or start failure.
    pub fn restore(&self, source: &Self, stateful: bool) -> Result<()> {
        let name = self.name();
        self.restore_inner(source, stateful)
            .map_err(|e| e.in_lifecycle("restore", &name))
    }

    fn restore_inner(&self, source: &Self, stateful: bool) -> Result<()> {
        let services = &self.services;
        let name = self.name();
        let source_name = source.name();
        let Some((parent, snapshot)) = source_name.split_once(SNAPSHOT_DELIMITER) else {
            return Err(CorralError::validation(format!("{source_name} is not a snapshot")));
        };
        if parent != name {
            return Err(CorralError::validation(format!("{source_name} is not a snapshot of {name}")));
        }
        services.storage.can_restore(&name, &source_name)?;
        let source_state = source.state_path();
        if source_state.exists() && !criu_available() {
            return Err(CorralError::validation(
                "failed to restore a stateful snapshot, criu isn't available",
            ));
        }
        if stateful && !source_state.exists() {
            return Err(CorralError::invalid_state("the snapshot has no state to restore"));
        }

        let was_running = self.is_running();
        if was_running {
            self.stop_for_restore()?;
        }

        tracing::info!(container = %name, snapshot, stateful, "restoring snapshot");
        services.storage.restore(&name, &source_name)?;
        let mut args = UpdateArgs::from_record(&source.record());
        args.expiry_date = self.record().expiry_date;
        self.update(args, false)?;

        if stateful {
            let state = self.state_path();
            if state.exists() {
                std::fs::remove_dir_all(&state).map_err(|e| CorralError::Io {
                    path: state.clone(),
                    source: e,
                })?;
            }
            copy_dir(&source_state, &state)?;
            self.update_record(|record| record.stateful = true)?;
        }

        services.emit(LifecycleEvent::new("container-snapshot-restored", &name).with("snapshot_name", snapshot));
        if stateful {
            return self.start(true);
        }
        if was_running {
            self.start(false)?;
        }
        Ok(())
    }

    /// Stops the container without letting an ephemeral one delete itself.
    fn stop_for_restore(&self) -> Result<()> {
        let ephemeral = self.is_ephemeral();
        if ephemeral {
            self.update_record(|record| record.ephemeral = false)?;
        }
        let stopped = self.stop(false);
        if ephemeral {
            self.update_record(|record| record.ephemeral = true)?;
        }
        stopped
    }
}
