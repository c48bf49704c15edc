//! Stop, shutdown, freeze and unfreeze.

use std::sync::{Arc, mpsc};
use std::time::Duration;

use corral_common::error::{CorralError, Result};
use corral_common::types::OperationAction;

use super::Container;
use crate::backend::{MigrateCommand, MigrateOptions, RuntimeHandle};
use crate::operation::Operation;

impl Container {
    /// Kills the container. With `stateful`, checkpoints it first and
    /// marks it stateful so the next start restores it.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when the container is stopped, the
    /// checkpoint or runtime library failure, or the operation's failure
    /// when the container is still running afterwards.
    pub fn stop(&self, stateful: bool) -> Result<()> {
        let name = self.name();
        self.stop_inner(stateful).map_err(|e| e.in_lifecycle("stop", &name))?;
        tracing::info!(container = %name, stateful, "container stopped");
        self.emit("container-stopped");
        Ok(())
    }

    fn stop_inner(&self, stateful: bool) -> Result<()> {
        if !self.is_running() {
            return Err(CorralError::invalid_state("the container is already stopped"));
        }
        let name = self.name();
        let op = self.services.operations.create(&name, OperationAction::Stop, false, true)?;
        tracing::info!(container = %name, stateful, "stopping container");

        if stateful {
            return self.checkpoint_and_stop(&op);
        }
        let state = self.state_path();
        if state.exists() {
            if let Err(e) = std::fs::remove_dir_all(&state) {
                tracing::warn!(container = %name, path = %state.display(), error = %e, "failed to remove leftover checkpoint");
            }
        }

        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(e) => {
                op.done(Some(&e));
                return Err(e);
            }
        };
        self.prevent_forks(&handle);
        if let Err(e) = handle.stop() {
            op.done(Some(&e));
            return Err(e);
        }
        self.finish_stop(&op)
    }

    fn checkpoint_and_stop(&self, op: &Arc<Operation>) -> Result<()> {
        let state = self.state_path();
        let result = (|| -> Result<()> {
            if state.exists() {
                std::fs::remove_dir_all(&state).map_err(|e| CorralError::Io {
                    path: state.clone(),
                    source: e,
                })?;
            }
            std::fs::create_dir_all(&state).map_err(|e| CorralError::Io {
                path: state.clone(),
                source: e,
            })?;
            let options = MigrateOptions {
                directory: state.clone(),
                stop: true,
                verbose: false,
            };
            self.handle()?.migrate(MigrateCommand::Dump, &options)
        })();
        if let Err(e) = result {
            op.done(Some(&e));
            return Err(e);
        }
        self.finish_stop(op)?;
        if let Err(e) = self.update_record(|record| record.stateful = true) {
            op.done(Some(&e));
            return Err(e);
        }
        Ok(())
    }

    /// Waits for the stop hook to finish `op`. When hooks run in another
    /// process nothing here would finish it, so the caller does.
    fn finish_stop(&self, op: &Arc<Operation>) -> Result<()> {
        if !self.services.runtime.hooks_in_process() {
            op.done(None);
        }
        match op.wait() {
            Err(e) if self.is_running() => Err(e),
            _ => Ok(()),
        }
    }

    /// Disables forking before the kill: `pids.max=0` when the pids
    /// controller exists, otherwise a freeze bounded by the freeze timeout.
    fn prevent_forks(&self, handle: &Arc<dyn RuntimeHandle>) {
        let driver = &self.services.driver;
        if driver.cgroup_pids {
            if let Err(e) = handle.set_cgroup_item("pids.max", "0") {
                tracing::warn!(container = %self.name(), error = %e, "failed to disable forking");
            }
        } else if driver.cgroup_freezer {
            let (tx, rx) = mpsc::channel();
            let freezer = Arc::clone(handle);
            let spawned = std::thread::Builder::new()
                .name("corral-freeze".into())
                .spawn(move || {
                    let _ = tx.send(freezer.freeze());
                });
            if spawned.is_err() {
                return;
            }
            if rx.recv_timeout(driver.freeze_timeout()).is_err() {
                tracing::warn!(container = %self.name(), "freeze timed out, thawing before stop");
                let _ = handle.unfreeze();
            }
        }
    }

    /// Asks the container to power off within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when the container is stopped, the
    /// runtime library failure, or the operation's failure when the
    /// container is still running afterwards.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let name = self.name();
        self.shutdown_inner(timeout).map_err(|e| e.in_lifecycle("shutdown", &name))?;
        tracing::info!(container = %name, "container shut down");
        self.emit("container-shutdown");
        Ok(())
    }

    fn shutdown_inner(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Err(CorralError::invalid_state("the container is already stopped"));
        }
        let name = self.name();
        let op = self.services.operations.create(&name, OperationAction::Stop, true, true)?;
        tracing::info!(container = %name, timeout_secs = timeout.as_secs(), "shutting down container");
        let result = self.handle().and_then(|handle| handle.shutdown(timeout));
        if let Err(e) = result {
            op.done(Some(&e));
            return Err(e);
        }
        self.finish_stop(&op)
    }

    /// Freezes every process of the container.
    ///
    /// A host without the freezer controller makes this a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when the container is not running or
    /// already frozen, or the runtime library failure.
    pub fn freeze(&self) -> Result<()> {
        let name = self.name();
        let froze = self.freeze_inner().map_err(|e| e.in_lifecycle("freeze", &name))?;
        if froze {
            tracing::info!(container = %name, "container frozen");
            self.emit("container-paused");
        }
        Ok(())
    }

    fn freeze_inner(&self) -> Result<bool> {
        let state = self.status();
        if !state.is_running() {
            return Err(CorralError::invalid_state("the container isn't running"));
        }
        if !self.services.driver.cgroup_freezer {
            tracing::info!(container = %self.name(), "unable to freeze container, no freezer controller");
            return Ok(false);
        }
        if state.is_frozen() {
            return Err(CorralError::invalid_state("the container is already frozen"));
        }
        self.handle()?.freeze()?;
        Ok(true)
    }

    /// Thaws a frozen container.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when the container is not running or
    /// not frozen, or the runtime library failure.
    pub fn unfreeze(&self) -> Result<()> {
        let name = self.name();
        let thawed = self.unfreeze_inner().map_err(|e| e.in_lifecycle("unfreeze", &name))?;
        if thawed {
            tracing::info!(container = %name, "container thawed");
            self.emit("container-resumed");
        }
        Ok(())
    }

    fn unfreeze_inner(&self) -> Result<bool> {
        let state = self.status();
        if !state.is_running() {
            return Err(CorralError::invalid_state("the container isn't running"));
        }
        if !self.services.driver.cgroup_freezer {
            tracing::info!(container = %self.name(), "unable to unfreeze container, no freezer controller");
            return Ok(false);
        }
        if !state.is_frozen() {
            return Err(CorralError::invalid_state("the container is already running"));
        }
        self.handle()?.unfreeze()?;
        Ok(true)
    }
}
