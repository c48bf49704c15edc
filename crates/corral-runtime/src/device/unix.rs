//! `unix-char` and `unix-block` devices.
//!
//! A node is created in the devices directory, bind-mounted at the
//! device's path inside the container, and allowed in the device cgroup.
//! USB and GPU passthrough reuse the same plumbing.

use std::path::{Path, PathBuf};

use corral_common::device::{Device, DeviceKind};
use corral_common::error::{CorralError, Result};
use corral_core::cgroup::{DEVICES_ALLOW, DEVICES_DENY, device_rule};
use corral_core::devnode::{self, DeviceNode, NodeType};

use super::{DeviceContext, DeviceHandler, DeviceOutcome, Phase};

const PREFIX: &str = "unix";

/// A device node to expose at `target` inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Absolute path inside the container.
    pub target: String,
    /// Node identity and mode.
    pub node: DeviceNode,
    /// Owner inside the container.
    pub uid: u32,
    /// Group inside the container.
    pub gid: u32,
}

/// Host path a unix device is read from: `source`, else `path`.
#[must_use]
pub fn source_path(device: &Device) -> &str {
    match device.value("source") {
        "" => device.value("path"),
        source => source,
    }
}

/// Path a unix device appears at in the container: `path`, else `source`.
#[must_use]
pub fn target_path(device: &Device) -> &str {
    match device.value("path") {
        "" => device.value("source"),
        path => path,
    }
}

/// Whether a missing source aborts the start. Defaults to true.
#[must_use]
pub fn is_required(device: &Device) -> bool {
    device.get("required").is_none_or(corral_common::types::is_true)
}

fn parse_id(device: &Device, key: &str) -> Result<u32> {
    match device.value(key) {
        "" => Ok(0),
        v => v
            .parse()
            .map_err(|_| CorralError::validation(format!("invalid {key} {v:?}"))),
    }
}

/// Owner of the node inside the container, from `uid`/`gid`.
///
/// # Errors
///
/// Returns a validation error for non-numeric ids.
pub fn owner(device: &Device) -> Result<(u32, u32)> {
    Ok((parse_id(device, "uid")?, parse_id(device, "gid")?))
}

/// Resolves the node of a unix device.
///
/// `major`/`minor` must be both set or both unset; unset numbers are read
/// from the host source. The mode comes from `mode`, else the source,
/// else `0660`.
///
/// # Errors
///
/// Returns a validation error when only one number is given or when the
/// source cannot be inspected.
pub fn resolve_node(device: &Device) -> Result<DeviceNode> {
    let node_type = match device.kind()? {
        DeviceKind::UnixBlock => NodeType::Block,
        _ => NodeType::Char,
    };
    let target = target_path(device);
    let mut node = match (device.value("major"), device.value("minor")) {
        ("", "") => devnode::inspect(Path::new(source_path(device))).map_err(|e| {
            CorralError::validation(format!("failed to get device attributes for {target}: {e}"))
        })?,
        ("", _) | (_, "") => {
            return Err(CorralError::validation(format!(
                "both major and minor must be supplied for device: {target}"
            )));
        }
        (major, minor) => {
            let number = |v: &str| {
                v.parse()
                    .map_err(|_| CorralError::validation(format!("invalid device number {v:?} for {target}")))
            };
            DeviceNode {
                node_type,
                major: number(major)?,
                minor: number(minor)?,
                mode: 0o660,
            }
        }
    };
    node.node_type = node_type;
    if let Some(mode) = device.get("mode") {
        node.mode = devnode::parse_mode(mode)?;
    }
    Ok(node)
}

/// Boot-time configuration for a node created at `host_path`.
pub fn boot_items(outcome: &mut DeviceOutcome, host_path: &Path, spec: &NodeSpec) {
    outcome.item(
        format!("lxc.cgroup2.{DEVICES_ALLOW}"),
        device_rule(spec.node.node_type, spec.node.major, spec.node.minor),
    );
    outcome.item(
        "lxc.mount.entry",
        format!(
            "{} {} none bind,create=file 0 0",
            host_path.display(),
            spec.target.trim_start_matches('/')
        ),
    );
}

/// Creates the host node for `spec` under the `unix.<device>` prefix.
///
/// # Errors
///
/// Returns an error if the node cannot be created.
pub fn create_node(ctx: &DeviceContext<'_>, device: &str, spec: &NodeSpec) -> Result<PathBuf> {
    ctx.ensure_devices_dir()?;
    let path = ctx.device_path(PREFIX, device, &spec.target);
    let (uid, gid) = ctx.host_owner(spec.uid, spec.gid);
    devnode::create(&path, &spec.node, uid, gid)?;
    Ok(path)
}

/// Creates a node and exposes it at boot or live.
///
/// # Errors
///
/// Returns an error if the node cannot be created or inserted.
pub fn add_node(ctx: &DeviceContext<'_>, device: &str, spec: &NodeSpec, phase: Phase) -> Result<DeviceOutcome> {
    let host_path = create_node(ctx, device, spec)?;
    let mut outcome = DeviceOutcome::default();
    match phase {
        Phase::Boot => boot_items(&mut outcome, &host_path, spec),
        Phase::Live => {
            let handle = ctx.live_handle()?;
            handle.insert_mount(&host_path, &spec.target, false)?;
            handle.set_cgroup_item(
                DEVICES_ALLOW,
                &device_rule(spec.node.node_type, spec.node.major, spec.node.minor),
            )?;
        }
    }
    tracing::debug!(container = ctx.container, device, target = %spec.target, "unix node added");
    Ok(outcome)
}

/// Takes a node away from the running container and deletes its host file.
///
/// `node` is used when the host file is already gone.
///
/// # Errors
///
/// Returns an error if the cgroup rule cannot be changed.
pub fn remove_node(ctx: &DeviceContext<'_>, device: &str, target: &str, node: Option<DeviceNode>) -> Result<()> {
    let handle = ctx.live_handle()?;
    let host_path = ctx.device_path(PREFIX, device, target);
    let node = devnode::inspect(&host_path).ok().or(node);
    if let Some(node) = node {
        handle.set_cgroup_item(DEVICES_DENY, &device_rule(node.node_type, node.major, node.minor))?;
    }
    if let Err(e) = handle.remove_mount(target) {
        tracing::warn!(container = ctx.container, device, target, error = %e, "failed to unmount device");
    }
    match std::fs::remove_file(&host_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CorralError::Io {
            path: host_path,
            source: e,
        }),
    }
}

/// Removes every node created under the `unix.<device>` prefix, for
/// passthrough devices whose host nodes may have disappeared.
///
/// # Errors
///
/// Returns the first removal failure.
pub fn remove_prefixed(ctx: &DeviceContext<'_>, device: &str) -> Result<()> {
    let prefix = format!("{PREFIX}.{}.", device.replace('/', "-"));
    let Ok(entries) = std::fs::read_dir(ctx.devices_dir) else {
        return Ok(());
    };
    let mut names: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&prefix))
        .collect();
    names.sort();
    for name in names {
        let target = format!("/{}", name[prefix.len()..].replace('-', "/"));
        remove_node(ctx, device, &target, None)?;
    }
    Ok(())
}

/// Handler of `unix-char` and `unix-block` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixHandler;

impl UnixHandler {
    fn spec(device: &Device) -> Result<NodeSpec> {
        let (uid, gid) = owner(device)?;
        Ok(NodeSpec {
            target: target_path(device).to_string(),
            node: resolve_node(device)?,
            uid,
            gid,
        })
    }

    /// Whether the source is missing and the device may wait for it.
    fn deferred(device: &Device) -> bool {
        device.value("major").is_empty()
            && device.value("minor").is_empty()
            && !Path::new(source_path(device)).exists()
            && !is_required(device)
    }
}

impl DeviceHandler for UnixHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        if Self::deferred(device) {
            tracing::info!(container = ctx.container, device = name, "optional device missing, watching for it");
            return Ok(DeviceOutcome {
                watches: vec![(name.to_string(), PathBuf::from(source_path(device)))],
                ..DeviceOutcome::default()
            });
        }
        add_node(ctx, name, &Self::spec(device)?, phase)
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<DeviceOutcome> {
        let fallback = resolve_node(device).ok();
        remove_node(ctx, name, target_path(device), fallback)?;
        Ok(DeviceOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_numbers_need_both_halves() {
        let dev = Device::from_pairs([("type", "unix-char"), ("path", "/dev/x"), ("major", "10")]);
        let err = resolve_node(&dev).unwrap_err();
        assert!(err.to_string().contains("both major and minor"));
    }

    #[test]
    fn explicit_numbers_and_mode() {
        let dev = Device::from_pairs([
            ("type", "unix-block"),
            ("path", "/dev/loop9"),
            ("major", "7"),
            ("minor", "9"),
            ("mode", "0600"),
        ]);
        let node = resolve_node(&dev).expect("node");
        assert_eq!(node.node_type, NodeType::Block);
        assert_eq!((node.major, node.minor, node.mode), (7, 9, 0o600));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn numbers_come_from_the_source() {
        let dev = Device::from_pairs([("type", "unix-char"), ("source", "/dev/null"), ("path", "/dev/mynull")]);
        let node = resolve_node(&dev).expect("node");
        assert_eq!((node.major, node.minor), (1, 3));
        assert_eq!(target_path(&dev), "/dev/mynull");
    }

    #[test]
    fn boot_items_allow_and_mount() {
        let spec = NodeSpec {
            target: "/dev/fuse".into(),
            node: DeviceNode {
                node_type: NodeType::Char,
                major: 10,
                minor: 229,
                mode: 0o666,
            },
            uid: 0,
            gid: 0,
        };
        let mut outcome = DeviceOutcome::default();
        boot_items(&mut outcome, Path::new("/var/lib/corral/containers/c1/devices/unix.fuse.dev-fuse"), &spec);
        assert_eq!(
            outcome.config_items,
            vec![
                ("lxc.cgroup2.devices.allow".to_string(), "c 10:229 rwm".to_string()),
                (
                    "lxc.mount.entry".to_string(),
                    "/var/lib/corral/containers/c1/devices/unix.fuse.dev-fuse dev/fuse none bind,create=file 0 0"
                        .to_string()
                ),
            ]
        );
    }

    #[test]
    fn required_defaults_to_true() {
        let mut dev = Device::from_pairs([("type", "unix-char"), ("path", "/dev/does-not-exist")]);
        assert!(is_required(&dev));
        assert!(!UnixHandler::deferred(&dev));
        let _ = dev.set("required", "false");
        assert!(UnixHandler::deferred(&dev));
    }
}
