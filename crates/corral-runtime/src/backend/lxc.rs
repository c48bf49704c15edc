//! Runtime library backend driving the LXC command line tools.
//!
//! Each handle accumulates configuration items in memory; they are written
//! to the container's `lxc.conf` before start. Lifecycle hooks are wired as
//! `corralctl callhook` commands, so they run in a separate process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use corral_common::error::{CorralError, Result};
use corral_common::types::StatusCode;
use corral_core::command::{run, run_in_namespaces};
use corral_core::filesystem::mount::{BindOptions, bind_mount, ensure_mount_target, unmount_detach};

use super::{LifecycleHooks, MigrateCommand, MigrateOptions, RuntimeHandle, RuntimeLibrary};

/// Directory inside the container where live mounts are staged.
const SHMOUNTS_TARGET: &str = "dev/.corral-mounts";

/// Factory for [`LxcHandle`]s.
#[derive(Debug, Clone)]
pub struct LxcTools {
    lxcpath: PathBuf,
    log_dir: PathBuf,
    hook_binary: PathBuf,
}

impl LxcTools {
    /// Creates a backend for containers under `lxcpath`, invoking
    /// `hook_binary callhook` for lifecycle hooks.
    #[must_use]
    pub fn new(lxcpath: &Path, log_dir: &Path, hook_binary: &Path) -> Self {
        Self {
            lxcpath: lxcpath.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
            hook_binary: hook_binary.to_path_buf(),
        }
    }
}

impl RuntimeLibrary for LxcTools {
    fn new_handle(
        &self,
        container: &str,
        _hooks: Weak<dyn LifecycleHooks>,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        let handle = LxcHandle {
            name: container.to_string(),
            lxcpath: self.lxcpath.clone(),
            shmounts: self.lxcpath.join(container).join("shmounts"),
            log_file: self.log_dir.join(container).join(corral_common::constants::RUNTIME_LOG_FILE),
            items: Mutex::new(Vec::new()),
        };
        let hook = |kind: &str| format!("{} callhook {container} {kind}", self.hook_binary.display());
        handle.set_config_item("lxc.hook.pre-start", &hook("start"))?;
        handle.set_config_item("lxc.hook.stop", &hook("stopns"))?;
        handle.set_config_item("lxc.hook.post-stop", &hook("stop"))?;
        handle.set_config_item(
            "lxc.mount.entry",
            &format!("{} {SHMOUNTS_TARGET} none bind,create=dir 0 0", handle.shmounts.display()),
        )?;
        Ok(Arc::new(handle))
    }

    fn hooks_in_process(&self) -> bool {
        false
    }

    fn network_up_hook(&self, container: &str, device: &str) -> Option<String> {
        Some(format!(
            "{} callhook {container} network-up {device}",
            self.hook_binary.display()
        ))
    }

    fn is_available(&self) -> bool {
        which::which("lxc-start").is_ok()
    }
}

/// A container driven through `lxc-*` commands.
#[derive(Debug)]
pub struct LxcHandle {
    name: String,
    lxcpath: PathBuf,
    shmounts: PathBuf,
    log_file: PathBuf,
    items: Mutex<Vec<(String, String)>>,
}

impl LxcHandle {
    fn base_args(&self) -> Vec<String> {
        vec![
            "-n".into(),
            self.name.clone(),
            "-P".into(),
            self.lxcpath.to_string_lossy().into_owned(),
        ]
    }

    fn tool(&self, program: &str, extra: &[&str]) -> Result<String> {
        let mut args = self.base_args();
        args.extend(extra.iter().map(|a| (*a).to_string()));
        run(program, &args)
    }

    fn info(&self, flag: &str) -> Result<String> {
        Ok(self.tool("lxc-info", &[flag, "-H"])?.trim().to_string())
    }
}

impl RuntimeHandle for LxcHandle {
    fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        if !key.starts_with("lxc.") {
            return Err(CorralError::validation(format!("invalid runtime config key: {key}")));
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn config_item(&self, key: &str) -> Vec<String> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn save_config_file(&self, path: &Path) -> Result<()> {
        let content: String = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| format!("{k} = {v}\n"))
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CorralError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| CorralError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn start(&self, config_path: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.shmounts).map_err(|e| CorralError::Io {
            path: self.shmounts.clone(),
            source: e,
        })?;
        let config = config_path.to_string_lossy();
        let log = self.log_file.to_string_lossy();
        let _ = self.tool("lxc-start", &["-d", "-f", &config, "-o", &log, "-l", "INFO"])?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let _ = self.tool("lxc-stop", &["-k"])?;
        Ok(())
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        let _ = self.tool("lxc-stop", &["-t", &secs])?;
        Ok(())
    }

    fn freeze(&self) -> Result<()> {
        let _ = self.tool("lxc-freeze", &[])?;
        Ok(())
    }

    fn unfreeze(&self) -> Result<()> {
        let _ = self.tool("lxc-unfreeze", &[])?;
        Ok(())
    }

    fn state(&self) -> Result<StatusCode> {
        match self.info("-s") {
            Ok(state) => state.parse(),
            // Containers started from a config file are unknown to lxc-info
            // once their monitor is gone.
            Err(e) if !self.lxcpath.join(&self.name).join("config").exists() => {
                tracing::debug!(container = %self.name, error = %e, "no monitor, reporting stopped");
                Ok(StatusCode::Stopped)
            }
            Err(e) => Err(e),
        }
    }

    fn init_pid(&self) -> Option<u32> {
        self.info("-p").ok().and_then(|pid| pid.parse().ok())
    }

    fn migrate(&self, command: MigrateCommand, options: &MigrateOptions) -> Result<()> {
        let dir = options.directory.to_string_lossy();
        let mut extra = vec!["-D", &*dir];
        match command {
            MigrateCommand::Dump if options.stop => extra.push("-s"),
            MigrateCommand::Dump => {}
            MigrateCommand::Restore => extra.push("-r"),
        }
        if options.verbose {
            extra.push("-v");
        }
        let _ = self.tool("lxc-checkpoint", &extra)?;
        Ok(())
    }

    fn attach_interface(&self, host_name: &str, container_name: &str) -> Result<()> {
        let _ = self.tool("lxc-device", &["add", host_name, container_name])?;
        Ok(())
    }

    fn detach_interface(&self, container_name: &str, host_name: &str) -> Result<()> {
        let _ = self.tool("lxc-device", &["del", container_name, host_name])?;
        Ok(())
    }

    fn cgroup_item(&self, key: &str) -> Result<String> {
        Ok(self.tool("lxc-cgroup", &[key])?.trim().to_string())
    }

    fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()> {
        let _ = self.tool("lxc-cgroup", &[key, value])?;
        Ok(())
    }

    fn insert_mount(&self, source: &Path, target: &str, readonly: bool) -> Result<()> {
        let pid = self
            .init_pid()
            .ok_or_else(|| CorralError::invalid_state("the container is not running"))?;
        let staged = target.trim_start_matches('/').replace('/', "-");
        let staging = self.shmounts.join(&staged);
        let directory = source.is_dir();
        ensure_mount_target(&staging, directory)?;
        bind_mount(
            source,
            &staging,
            BindOptions {
                readonly,
                ..BindOptions::default()
            },
        )?;

        let inside = format!("/{SHMOUNTS_TARGET}/{staged}");
        let create = if directory { "mkdir -p \"$1\"" } else { "mkdir -p \"$(dirname \"$1\")\" && touch \"$1\"" };
        let result = run_in_namespaces(pid, &["--mount"], &["sh", "-c", create, "sh", target])
            .and_then(|_| run_in_namespaces(pid, &["--mount"], &["mount", "--move", &inside, target]));
        if let Err(e) = result {
            let _ = unmount_detach(&staging);
            return Err(e);
        }
        let _ = std::fs::remove_file(&staging).or_else(|_| std::fs::remove_dir(&staging));
        Ok(())
    }

    fn remove_mount(&self, target: &str) -> Result<()> {
        let pid = self
            .init_pid()
            .ok_or_else(|| CorralError::invalid_state("the container is not running"))?;
        let _ = run_in_namespaces(pid, &["--mount"], &["umount", "-l", target])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<dyn RuntimeHandle> {
        let tools = LxcTools::new(
            Path::new("/var/lib/corral/containers"),
            Path::new("/var/log/corral"),
            Path::new("/usr/bin/corralctl"),
        );
        let hooks: Weak<dyn LifecycleHooks> = Weak::<NoHooks>::new();
        tools.new_handle("c1", hooks).expect("handle")
    }

    struct NoHooks;

    impl LifecycleHooks for NoHooks {
        fn on_start(&self) -> Result<()> {
            Ok(())
        }
        fn on_stop_ns(&self, _target: &str, _netns: &str) -> Result<()> {
            Ok(())
        }
        fn on_stop(&self, _target: &str) -> Result<()> {
            Ok(())
        }
        fn on_network_up(&self, _device: &str, _host_name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hooks_call_back_into_the_binary() {
        let handle = handle();
        assert_eq!(
            handle.config_item("lxc.hook.post-stop"),
            vec!["/usr/bin/corralctl callhook c1 stop"]
        );
        assert_eq!(handle.config_item("lxc.hook.stop").len(), 1);
    }

    #[test]
    fn config_file_lists_items_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = handle();
        handle.set_config_item("lxc.uts.name", "c1").expect("set");
        handle.set_config_item("lxc.idmap", "u 0 1000000 65536").expect("set");
        handle.set_config_item("lxc.idmap", "g 0 1000000 65536").expect("set");
        let path = dir.path().join("c1/lxc.conf");
        handle.save_config_file(&path).expect("save");

        let content = std::fs::read_to_string(&path).expect("read");
        let idmaps: Vec<&str> = content.lines().filter(|l| l.starts_with("lxc.idmap")).collect();
        assert_eq!(idmaps, vec!["lxc.idmap = u 0 1000000 65536", "lxc.idmap = g 0 1000000 65536"]);
        assert!(content.ends_with("lxc.idmap = g 0 1000000 65536\n"));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        assert!(handle().set_config_item("limits.cpu", "2").is_err());
    }
}
