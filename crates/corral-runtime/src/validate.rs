//! Validation of container configuration keys, devices and profile lists.
//!
//! Everything here runs before any mutation, so a rejected request leaves
//! the container untouched.

use std::collections::BTreeSet;

use corral_common::constants::{DEFAULT_ISOLATED_IDMAP_SIZE, keys};
use corral_common::device::{Device, DeviceKind, Devices};
use corral_common::error::{CorralError, Result};
use corral_common::types::ConfigMap;
use corral_core::cgroup::cpu::cpu_items;
use corral_core::cgroup::io::DiskLimit;
use corral_core::devnode::parse_mode;
use corral_core::idmap::raw::parse_raw_idmap;
use corral_core::idmap::{MAX_ID, check_block};
use corral_core::units::{parse_bit_rate, parse_byte_size};

use crate::device::nic::NicType;
use crate::device::proxy::{ProxyAddress, ProxyBind};

/// Runtime configuration keys `raw.lxc` may not set.
const RAW_LXC_FORBIDDEN: [&str; 6] = [
    "lxc.log.file",
    "lxc.log.syslog",
    "lxc.ephemeral",
    "lxc.rootfs.path",
    "lxc.uts.name",
    "lxc.idmap",
];

fn invalid(key: &str, value: &str) -> CorralError {
    CorralError::validation(format!("invalid value for {key}: {value:?}"))
}

fn check_bool(key: &str, value: &str) -> Result<()> {
    match value.to_ascii_lowercase().as_str() {
        "" | "true" | "false" | "1" | "0" | "yes" | "no" | "on" | "off" => Ok(()),
        _ => Err(invalid(key, value)),
    }
}

fn check_priority(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    match value.parse::<u8>() {
        Ok(p) if p <= 10 => Ok(()),
        _ => Err(invalid(key, value)),
    }
}

fn check_number(key: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.parse::<u64>().is_ok() {
        Ok(())
    } else {
        Err(invalid(key, value))
    }
}

/// Validates `raw.lxc`: `key = value` lines on `lxc.` keys the driver
/// does not own. Blank lines and `#` comments are allowed.
///
/// # Errors
///
/// Returns a validation error naming the first bad line.
pub fn check_raw_lxc(value: &str) -> Result<Vec<(String, String)>> {
    let mut items = Vec::new();
    for line in value.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            return Err(CorralError::validation(format!("invalid raw.lxc line: {line:?}")));
        };
        let key = key.trim();
        if !key.starts_with("lxc.") {
            return Err(CorralError::validation(format!("invalid raw.lxc key: {key:?}")));
        }
        if RAW_LXC_FORBIDDEN.contains(&key) {
            return Err(CorralError::validation(format!(
                "setting {key} through raw.lxc is not allowed"
            )));
        }
        items.push((key.to_string(), val.trim().to_string()));
    }
    Ok(items)
}

fn check_memory(value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if let Some(percent) = value.strip_suffix('%') {
        return match percent.parse::<u8>() {
            Ok(p) if p <= 100 => Ok(()),
            _ => Err(invalid(keys::LIMITS_MEMORY, value)),
        };
    }
    parse_byte_size(value).map(|_| ())
}

fn check_kernel_modules(value: &str) -> Result<()> {
    for module in value.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        if !module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(keys::LINUX_KERNEL_MODULES, value));
        }
    }
    Ok(())
}

/// Validates one configuration key.
///
/// # Errors
///
/// Returns a validation error for unknown keys or malformed values.
pub fn check_config_key(key: &str, value: &str) -> Result<()> {
    match key {
        keys::SECURITY_PRIVILEGED
        | keys::SECURITY_IDMAP_ISOLATED
        | keys::SECURITY_PROTECTION_DELETE
        | keys::SECURITY_PROTECTION_SHIFT
        | keys::SECURITY_NESTING
        | keys::LIMITS_MEMORY_SWAP
        | "boot.autostart" => check_bool(key, value),
        keys::SECURITY_IDMAP_BASE => match value {
            "" => Ok(()),
            base => match base.parse::<i64>() {
                Ok(n) if (0..=MAX_ID).contains(&n) => Ok(()),
                _ => Err(invalid(key, value)),
            },
        },
        keys::SECURITY_IDMAP_SIZE => match value {
            "" | "auto" => Ok(()),
            size => match size.parse::<i64>() {
                Ok(n) if n > 0 && n <= MAX_ID + 1 => Ok(()),
                _ => Err(invalid(key, value)),
            },
        },
        keys::LIMITS_PROCESSES => check_number(key, value),
        keys::LIMITS_MEMORY => check_memory(value),
        keys::LIMITS_MEMORY_ENFORCE => match value {
            "" | "hard" | "soft" => Ok(()),
            _ => Err(invalid(key, value)),
        },
        keys::LIMITS_CPU_ALLOWANCE => cpu_items(value, "").map(|_| ()),
        keys::LIMITS_CPU_PRIORITY | keys::LIMITS_DISK_PRIORITY | keys::LIMITS_NETWORK_PRIORITY => {
            check_priority(key, value)
        }
        keys::RAW_IDMAP => parse_raw_idmap(value).map(|_| ()),
        keys::RAW_LXC => check_raw_lxc(value).map(|_| ()),
        keys::LINUX_KERNEL_MODULES => check_kernel_modules(value),
        "boot.host_shutdown_timeout" | "boot.stop.priority" => check_number(key, value),
        k if k.starts_with(keys::VOLATILE_PREFIX)
            || k.starts_with(keys::IMAGE_PREFIX)
            || k.starts_with("user.")
            || k.starts_with("environment.") =>
        {
            Ok(())
        }
        _ => Err(CorralError::validation(format!("unknown configuration key: {key}"))),
    }
}

/// Validates a configuration map.
///
/// # Errors
///
/// Returns a validation error for the first bad key.
pub fn validate_config(config: &ConfigMap) -> Result<()> {
    for (key, value) in config {
        check_config_key(key, value)?;
    }
    check_idmap_block(config)
}

/// An explicit `security.idmap.base` must leave room for the whole range.
fn check_idmap_block(config: &ConfigMap) -> Result<()> {
    let Some(base) = config
        .get(keys::SECURITY_IDMAP_BASE)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return Ok(());
    };
    let size = match config.get(keys::SECURITY_IDMAP_SIZE).map(String::as_str) {
        None | Some("" | "auto") => DEFAULT_ISOLATED_IDMAP_SIZE,
        Some(size) => size.parse().map_err(|_| invalid(keys::SECURITY_IDMAP_SIZE, size))?,
    };
    check_block(base, size).map_err(|e| CorralError::validation(e.to_string()))
}

/// Carries volatile and image keys over from `old` into a user supplied
/// configuration.
///
/// # Errors
///
/// Returns a validation error when the request changes one of them.
pub fn merge_read_only(old: &ConfigMap, requested: &ConfigMap) -> Result<ConfigMap> {
    let read_only = |k: &str| k.starts_with(keys::VOLATILE_PREFIX) || k.starts_with(keys::IMAGE_PREFIX);
    for (key, value) in requested {
        if read_only(key) && old.get(key) != Some(value) {
            let what = if key.starts_with(keys::IMAGE_PREFIX) { "image" } else { "volatile" };
            return Err(CorralError::validation(format!("{what} keys are read-only: {key}")));
        }
    }
    let mut merged = requested.clone();
    for (key, value) in old {
        if read_only(key) && !merged.contains_key(key) {
            let _ = merged.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}

fn allowed_keys(kind: DeviceKind) -> &'static [&'static str] {
    match kind {
        DeviceKind::Nic => &[
            "nictype",
            "name",
            "parent",
            "host_name",
            "hwaddr",
            "mtu",
            "vlan",
            "limits.ingress",
            "limits.egress",
            "limits.max",
            "ipv4.address",
            "ipv6.address",
            "ipv4.routes",
            "ipv6.routes",
            "security.mac_filtering",
        ],
        DeviceKind::Infiniband => &["nictype", "name", "parent", "hwaddr", "mtu"],
        DeviceKind::Disk => &[
            "path",
            "source",
            "pool",
            "size",
            "readonly",
            "optional",
            "recursive",
            "propagation",
            "limits.read",
            "limits.write",
            "limits.max",
        ],
        DeviceKind::UnixChar | DeviceKind::UnixBlock => {
            &["source", "path", "major", "minor", "uid", "gid", "mode", "required"]
        }
        DeviceKind::Usb => &["vendorid", "productid", "uid", "gid", "mode", "required"],
        DeviceKind::Gpu => &["vendorid", "productid", "id", "pci", "uid", "gid", "mode"],
        DeviceKind::Proxy => &["listen", "connect", "bind", "nat"],
        DeviceKind::None => &[],
    }
}

fn require(name: &str, device: &Device, key: &str) -> Result<()> {
    if device.value(key).is_empty() {
        return Err(CorralError::validation(format!(
            "missing {key} for device {name}"
        )));
    }
    Ok(())
}

fn check_nic(name: &str, device: &Device, kind: DeviceKind) -> Result<()> {
    let nic: NicType = device.value("nictype").parse()?;
    if kind == DeviceKind::Infiniband && !nic.is_passthrough() {
        return Err(CorralError::validation(format!(
            "infiniband device {name} must be physical or sriov"
        )));
    }
    if nic != NicType::P2p {
        require(name, device, "parent")?;
    }
    for key in ["limits.ingress", "limits.egress", "limits.max"] {
        let value = device.value(key);
        if !value.is_empty() {
            let _ = parse_bit_rate(value)?;
        }
    }
    check_number("mtu", device.value("mtu"))?;
    check_bool("security.mac_filtering", device.value("security.mac_filtering"))?;
    let hwaddr = device.value("hwaddr");
    if !hwaddr.is_empty() && !valid_hwaddr(hwaddr) {
        return Err(invalid("hwaddr", hwaddr));
    }
    Ok(())
}

fn valid_hwaddr(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn check_disk(name: &str, device: &Device) -> Result<()> {
    require(name, device, "path")?;
    if device.is_root_disk() {
        if !device.value("source").is_empty() {
            return Err(CorralError::validation(format!(
                "root disk {name} cannot have a source"
            )));
        }
        if !device.value("size").is_empty() {
            let _ = parse_byte_size(device.value("size"))?;
        }
    } else {
        require(name, device, "source")?;
        if !device.value("size").is_empty() {
            return Err(CorralError::validation(format!(
                "only the root disk may have a size quota, not {name}"
            )));
        }
    }
    for key in ["limits.read", "limits.write", "limits.max"] {
        let value = device.value(key);
        if !value.is_empty() {
            let _ = DiskLimit::parse(value)?;
        }
    }
    for key in ["readonly", "optional", "recursive"] {
        check_bool(key, device.value(key))?;
    }
    match device.value("propagation") {
        "" => Ok(()),
        mode => mode
            .parse::<corral_core::filesystem::mount::Propagation>()
            .map(|_| ()),
    }
}

fn check_unix(name: &str, device: &Device) -> Result<()> {
    if device.value("source").is_empty() && device.value("path").is_empty() {
        return Err(CorralError::validation(format!(
            "unix device {name} needs a source or a path"
        )));
    }
    let major = device.value("major");
    let minor = device.value("minor");
    if major.is_empty() != minor.is_empty() {
        return Err(CorralError::validation(format!(
            "unix device {name} needs both major and minor or neither"
        )));
    }
    check_number("major", major)?;
    check_number("minor", minor)?;
    check_bool("required", device.value("required"))
}

fn check_owner_keys(device: &Device) -> Result<()> {
    check_number("uid", device.value("uid"))?;
    check_number("gid", device.value("gid"))?;
    match device.get("mode") {
        Some(mode) => parse_mode(mode).map(|_| ()),
        None => Ok(()),
    }
}

fn check_proxy(name: &str, device: &Device) -> Result<()> {
    require(name, device, "listen")?;
    require(name, device, "connect")?;
    let _ = ProxyAddress::parse(device.value("listen"))?;
    let _ = ProxyAddress::parse(device.value("connect"))?;
    let bind = ProxyBind::parse(device.value("bind")).map_err(|_| invalid("bind", device.value("bind")))?;
    check_bool("nat", device.value("nat"))?;
    if device.is_true("nat") && bind != ProxyBind::Host {
        return Err(CorralError::validation(format!(
            "device {name}: only host-bound proxies can use NAT"
        )));
    }
    Ok(())
}

/// Validates one device.
///
/// # Errors
///
/// Returns a validation error naming the device and the problem.
pub fn check_device(name: &str, device: &Device) -> Result<()> {
    if name.is_empty() {
        return Err(CorralError::validation("device names cannot be empty"));
    }
    let kind = device.kind()?;
    let allowed = allowed_keys(kind);
    for (key, _) in device.iter() {
        if key != "type" && !allowed.contains(&key) {
            return Err(CorralError::validation(format!(
                "invalid device key {key} for {kind} device {name}"
            )));
        }
    }
    match kind {
        DeviceKind::Nic | DeviceKind::Infiniband => check_nic(name, device, kind),
        DeviceKind::Disk => check_disk(name, device),
        DeviceKind::UnixChar | DeviceKind::UnixBlock => {
            check_unix(name, device)?;
            check_owner_keys(device)
        }
        DeviceKind::Usb | DeviceKind::Gpu => {
            check_bool("required", device.value("required"))?;
            check_owner_keys(device)
        }
        DeviceKind::Proxy => check_proxy(name, device),
        DeviceKind::None => Ok(()),
    }
}

/// Validates a device set. Expanded sets must hold exactly one root disk
/// and no two disks may share a mount path.
///
/// # Errors
///
/// Returns a validation error for the first problem found.
pub fn validate_devices(devices: &Devices, expanded: bool) -> Result<()> {
    let mut paths = BTreeSet::new();
    for (name, device) in devices.iter() {
        check_device(name, device)?;
        if device.kind()? == DeviceKind::Disk && !paths.insert(device.value("path")) {
            return Err(CorralError::validation(format!(
                "more than one disk device uses the path {}",
                device.value("path")
            )));
        }
    }
    if expanded {
        let _ = devices.root_disk()?;
    }
    Ok(())
}

/// Rejects profile lists naming a profile twice.
///
/// # Errors
///
/// Returns a validation error naming the duplicate.
pub fn validate_profiles(names: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(CorralError::validation(format!(
                "duplicate profile found in request: {name}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn root() -> Device {
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default")])
    }

    #[test]
    fn known_keys_are_checked() {
        validate_config(&config(&[
            ("security.idmap.isolated", "true"),
            ("security.idmap.size", "65536"),
            ("limits.memory", "50%"),
            ("limits.cpu.allowance", "25ms/100ms"),
            ("limits.cpu.priority", "5"),
            ("user.note", "anything"),
            ("volatile.eth0.hwaddr", "00:16:3e:00:00:01"),
        ]))
        .expect("valid");
        assert!(check_config_key("limits.memory", "lots").is_err());
        assert!(check_config_key("limits.disk.priority", "11").is_err());
        assert!(check_config_key("security.privileged", "maybe").is_err());
        assert!(check_config_key("security.idmap.size", "0").is_err());
        assert!(check_config_key("no.such.key", "1").is_err());
        assert!(check_config_key("raw.idmap", "both 1000 1000-1001").is_err());
    }

    #[test]
    fn idmap_ranges_must_fit_the_id_space() {
        let raw = "uid 0-9223372036854775807 0-9223372036854775807";
        assert!(check_config_key("raw.idmap", raw).is_err());
        assert!(check_config_key("security.idmap.base", "9223372036854775000").is_err());
        assert!(check_config_key("security.idmap.size", "4294967297").is_err());

        validate_config(&config(&[("security.idmap.base", "4294901760")])).expect("last block fits");
        let err = validate_config(&config(&[
            ("security.idmap.isolated", "true"),
            ("security.idmap.base", "4294967000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn raw_lxc_lines_are_parsed() {
        let items = check_raw_lxc("# comment\nlxc.apparmor.profile = unconfined\n\nlxc.cap.drop=").expect("valid");
        assert_eq!(
            items,
            vec![
                ("lxc.apparmor.profile".to_string(), "unconfined".to_string()),
                ("lxc.cap.drop".to_string(), String::new()),
            ]
        );
        assert!(check_raw_lxc("lxc.log.file = /tmp/x").is_err());
        assert!(check_raw_lxc("security.privileged = true").is_err());
        assert!(check_raw_lxc("no equals sign").is_err());
    }

    #[test]
    fn read_only_keys_survive_user_updates() {
        let old = config(&[("volatile.idmap.base", "0"), ("image.os", "debian"), ("limits.memory", "1GB")]);
        let merged = merge_read_only(&old, &config(&[("limits.memory", "2GB")])).expect("merge");
        assert_eq!(merged.get("volatile.idmap.base").map(String::as_str), Some("0"));
        assert_eq!(merged.get("image.os").map(String::as_str), Some("debian"));
        assert_eq!(merged.get("limits.memory").map(String::as_str), Some("2GB"));

        let err = merge_read_only(&old, &config(&[("volatile.idmap.base", "65536")])).expect_err("read-only");
        assert!(err.to_string().contains("volatile keys are read-only"));
    }

    #[test]
    fn devices_need_their_keys() {
        let nic = Device::from_pairs([("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]);
        check_device("eth0", &nic).expect("valid nic");
        let orphan = Device::from_pairs([("type", "nic"), ("nictype", "bridged")]);
        assert!(check_device("eth0", &orphan).is_err());
        let p2p = Device::from_pairs([("type", "nic"), ("nictype", "p2p"), ("limits.ingress", "10Mbit")]);
        check_device("eth1", &p2p).expect("p2p needs no parent");

        let disk = Device::from_pairs([("type", "disk"), ("path", "/data")]);
        assert!(check_device("data", &disk).is_err());
        let unknown = Device::from_pairs([("type", "disk"), ("path", "/data"), ("source", "/srv"), ("colour", "red")]);
        assert!(check_device("data", &unknown).is_err());

        let half = Device::from_pairs([("type", "unix-char"), ("path", "/dev/fuse"), ("major", "10")]);
        assert!(check_device("fuse", &half).is_err());

        let proxy = Device::from_pairs([("type", "proxy"), ("listen", "tcp:0.0.0.0:80"), ("connect", "tcp:127.0.0.1:80")]);
        check_device("web", &proxy).expect("valid proxy");
    }

    #[test]
    fn proxies_bind_on_either_side_but_nat_only_on_the_host() {
        let proxy = |bind: &'static str, nat: &'static str| {
            Device::from_pairs([
                ("type", "proxy"),
                ("listen", "tcp:127.0.0.1:3306"),
                ("connect", "tcp:10.0.0.5:3306"),
                ("bind", bind),
                ("nat", nat),
            ])
        };
        check_device("db", &proxy("container", "")).expect("container bind");
        check_device("db", &proxy("host", "true")).expect("host nat");
        assert!(check_device("db", &proxy("container", "true")).is_err());
        assert!(check_device("db", &proxy("guest", "")).is_err());
    }

    #[test]
    fn expanded_sets_need_exactly_one_root_disk() {
        let mut devices = Devices::new();
        assert!(validate_devices(&devices, false).is_ok());
        assert!(validate_devices(&devices, true).is_err());

        let _ = devices.insert("root", root());
        validate_devices(&devices, true).expect("one root disk");

        let _ = devices.insert("root2", Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "other")]));
        let err = validate_devices(&devices, true).expect_err("two root disks");
        assert!(err.to_string().contains("path /") || err.to_string().contains("root disk"));
    }

    #[test]
    fn duplicate_profiles_are_rejected() {
        validate_profiles(&["default".into(), "gpu".into()]).expect("distinct");
        let err = validate_profiles(&["default".into(), "default".into()]).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate profile"));
    }
}
