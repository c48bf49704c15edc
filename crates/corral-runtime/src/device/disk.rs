//! `disk` devices: bind mounts of host paths or custom volumes, and io
//! throttling of the block device backing them.

use std::path::{Path, PathBuf};

use corral_common::device::Device;
use corral_common::error::{CorralError, Result};
use corral_core::cgroup::io::{BlockLimits, DiskLimit, io_max_line};
use corral_core::filesystem::mount::{BindOptions, bind_mount, ensure_mount_target, unmount_detach};

use super::{DeviceContext, DeviceHandler, DeviceOutcome, Phase};

const PREFIX: &str = "disk";

/// Host path mounted by a disk device.
///
/// A `pool` on a non-root disk names a custom volume of that pool.
#[must_use]
pub fn source_path(ctx: &DeviceContext<'_>, device: &Device) -> PathBuf {
    let source = device.value("source");
    match device.value("pool") {
        "" => PathBuf::from(source),
        _ if device.is_root_disk() => ctx.storage.rootfs_path(ctx.container),
        pool => ctx
            .driver
            .data_dir
            .join("storage-pools")
            .join(pool)
            .join("custom")
            .join(source),
    }
}

/// Read/write limits from `limits.read`, `limits.write` and `limits.max`.
///
/// # Errors
///
/// Returns a validation error for malformed values.
pub fn limits(device: &Device) -> Result<BlockLimits> {
    let pick = |key: &str| match (device.value(key), device.value("limits.max")) {
        ("", "") => Ok(None),
        ("", max) => DiskLimit::parse(max).map(Some),
        (value, _) => DiskLimit::parse(value).map(Some),
    };
    Ok(BlockLimits {
        read: pick("limits.read")?,
        write: pick("limits.write")?,
    })
}

/// Major and minor of the whole disk holding `path`. Partitions resolve
/// to their parent disk through `<sysfs>/dev/block`.
///
/// # Errors
///
/// Returns an error if `path` cannot be inspected.
pub fn backing_device(sysfs_root: &Path, path: &Path) -> Result<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let dev = meta.dev();
    let major = u32::try_from(nix::sys::stat::major(dev)).unwrap_or(u32::MAX);
    let minor = u32::try_from(nix::sys::stat::minor(dev)).unwrap_or(u32::MAX);
    let block = sysfs_root.join("dev/block").join(format!("{major}:{minor}"));
    if !block.join("partition").exists() {
        return Ok((major, minor));
    }
    let parent = std::fs::read_to_string(block.join("../dev")).unwrap_or_default();
    Ok(parse_dev_numbers(&parent).unwrap_or((major, minor)))
}

fn parse_dev_numbers(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn io_line(ctx: &DeviceContext<'_>, device: &Device) -> Result<Option<String>> {
    let limits = limits(device)?;
    let source = source_path(ctx, device);
    if limits.is_empty() || !source.exists() {
        return Ok(None);
    }
    let (major, minor) = backing_device(&ctx.driver.sysfs_root, &source)?;
    Ok(Some(io_max_line(major, minor, &limits)))
}

/// Handler of `disk` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskHandler;

impl DiskHandler {
    fn mount_options(device: &Device, directory: bool) -> String {
        let mut options = vec![
            if device.is_true("recursive") { "rbind" } else { "bind" }.to_string(),
            format!("create={}", if directory { "dir" } else { "file" }),
        ];
        if device.is_true("readonly") {
            options.push("ro".into());
        }
        if device.is_true("optional") {
            options.push("optional".into());
        }
        options.join(",")
    }

    /// Mounts the source on its devices-directory mount point.
    fn prepare(ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<Option<(PathBuf, bool)>> {
        let source = source_path(ctx, device);
        if !source.exists() {
            if device.is_true("optional") {
                return Ok(None);
            }
            return Err(CorralError::validation(format!(
                "source path {} doesn't exist for device {name}",
                source.display()
            )));
        }
        let directory = source.is_dir();
        ctx.ensure_devices_dir()?;
        let target = ctx.device_path(PREFIX, name, device.value("path"));
        if target.exists() {
            let _ = unmount_detach(&target);
        }
        ensure_mount_target(&target, directory)?;
        let propagation = match device.value("propagation") {
            "" => None,
            mode => Some(mode.parse()?),
        };
        bind_mount(
            &source,
            &target,
            BindOptions {
                readonly: device.is_true("readonly"),
                recursive: device.is_true("recursive"),
                propagation,
            },
        )?;
        Ok(Some((target, directory)))
    }
}

impl DeviceHandler for DiskHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        let mut outcome = DeviceOutcome::default();
        if device.is_root_disk() {
            if let Some(line) = io_line(ctx, device)? {
                outcome.item("lxc.cgroup2.io.max", line);
            }
            return Ok(outcome);
        }
        let Some((target, directory)) = Self::prepare(ctx, name, device)? else {
            tracing::warn!(container = ctx.container, device = name, "optional disk source missing, skipped");
            return Ok(outcome);
        };
        let path = device.value("path");
        match phase {
            Phase::Boot => {
                outcome.item(
                    "lxc.mount.entry",
                    format!(
                        "{} {} none {} 0 0",
                        target.display(),
                        path.trim_start_matches('/'),
                        Self::mount_options(device, directory)
                    ),
                );
                if let Some(line) = io_line(ctx, device)? {
                    outcome.item("lxc.cgroup2.io.max", line);
                }
            }
            Phase::Live => {
                let handle = ctx.live_handle()?;
                if let Err(e) = handle.insert_mount(&target, path, device.is_true("readonly")) {
                    let _ = unmount_detach(&target);
                    return Err(e);
                }
                if let Some(line) = io_line(ctx, device)? {
                    handle.set_cgroup_item("io.max", &line)?;
                }
            }
        }
        tracing::debug!(container = ctx.container, device = name, path, "disk mounted");
        Ok(outcome)
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<DeviceOutcome> {
        let handle = ctx.live_handle()?;
        let path = device.value("path");
        if let Err(e) = handle.remove_mount(path) {
            tracing::warn!(container = ctx.container, device = name, path, error = %e, "failed to unmount disk");
        }
        let target = ctx.device_path(PREFIX, name, path);
        if target.exists() {
            unmount_detach(&target)?;
            let removed = if target.is_dir() {
                std::fs::remove_dir(&target)
            } else {
                std::fs::remove_file(&target)
            };
            removed.map_err(|e| CorralError::Io {
                path: target.clone(),
                source: e,
            })?;
        }
        Ok(DeviceOutcome::default())
    }

    fn update(
        &self,
        ctx: &DeviceContext<'_>,
        name: &str,
        old: &Device,
        new: &Device,
        changed: &[String],
    ) -> Result<DeviceOutcome> {
        if !changed.iter().any(|k| k.starts_with("limits.")) || limits(old)? == limits(new)? {
            return Ok(DeviceOutcome::default());
        }
        let source = source_path(ctx, new);
        if !source.exists() {
            return Ok(DeviceOutcome::default());
        }
        let (major, minor) = backing_device(&ctx.driver.sysfs_root, &source)?;
        let line = io_max_line(major, minor, &limits(new)?);
        ctx.live_handle()?.set_cgroup_item("io.max", &line)?;
        tracing::debug!(container = ctx.container, device = name, line, "disk limits updated");
        Ok(DeviceOutcome::default())
    }
}
