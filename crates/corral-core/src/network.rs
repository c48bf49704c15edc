//! Host-side network interface plumbing.
//!
//! Interfaces are managed through the `ip`, `tc` and `ebtables` helpers, the
//! same tools an administrator would use, so every action is reproducible
//! from a shell.

use std::path::Path;

use corral_common::constants::MAC_PREFIX;
use corral_common::error::Result;

use crate::command::run;
use crate::units::parse_bit_rate;

/// Whether an interface called `name` exists under `<sysfs>/class/net`.
#[must_use]
pub fn interface_exists(sysfs_root: &Path, name: &str) -> bool {
    sysfs_root.join("class/net").join(name).exists()
}

/// A random host-side veth name: `veth` followed by 8 hex characters.
#[must_use]
pub fn random_veth_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..8])
}

/// A random MAC address in the `00:16:3e` range.
#[must_use]
pub fn random_hwaddr() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!(
        "{MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2]
    )
}

/// First `ethN` name not present in `taken`.
#[must_use]
pub fn next_interface_name<'a>(taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<&str> = taken.into_iter().collect();
    (0..)
        .map(|i| format!("eth{i}"))
        .find(|name| !taken.contains(&name.as_str()))
        .unwrap_or_else(|| "eth0".to_string())
}

/// Creates a veth pair and brings the host end up.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn create_veth(host_name: &str, peer_name: &str) -> Result<()> {
    let _ = run(
        "ip",
        &["link", "add", "dev", host_name, "type", "veth", "peer", "name", peer_name],
    )?;
    let _ = run("ip", &["link", "set", "dev", host_name, "up"])?;
    tracing::debug!(host_name, peer_name, "veth pair created");
    Ok(())
}

/// Creates a macvlan interface on `parent`.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn create_macvlan(name: &str, parent: &str) -> Result<()> {
    let _ = run(
        "ip",
        &["link", "add", "dev", name, "link", parent, "type", "macvlan", "mode", "bridge"],
    )?;
    tracing::debug!(name, parent, "macvlan created");
    Ok(())
}

/// Attaches `name` to `bridge`.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn attach_to_bridge(name: &str, bridge: &str) -> Result<()> {
    let _ = run("ip", &["link", "set", "dev", name, "master", bridge])?;
    Ok(())
}

/// Deletes an interface. Missing interfaces are not an error.
///
/// # Errors
///
/// Returns an error if `ip` fails for an existing interface.
pub fn delete_link(sysfs_root: &Path, name: &str) -> Result<()> {
    if !interface_exists(sysfs_root, name) {
        return Ok(());
    }
    let _ = run("ip", &["link", "del", "dev", name])?;
    tracing::debug!(name, "interface deleted");
    Ok(())
}

/// Sets the MTU of an interface.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn set_mtu(name: &str, mtu: &str) -> Result<()> {
    let _ = run("ip", &["link", "set", "dev", name, "mtu", mtu])?;
    Ok(())
}

/// Sets the MAC address of an interface.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn set_hwaddr(name: &str, hwaddr: &str) -> Result<()> {
    let _ = run("ip", &["link", "set", "dev", name, "address", hwaddr])?;
    Ok(())
}

/// Renames an interface, taking it down first.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn rename_link(name: &str, new_name: &str) -> Result<()> {
    let _ = run("ip", &["link", "set", "dev", name, "down"])?;
    let _ = run("ip", &["link", "set", "dev", name, "name", new_name])?;
    Ok(())
}

/// Reads the MTU and MAC address of an interface from sysfs.
#[must_use]
pub fn link_properties(sysfs_root: &Path, name: &str) -> (Option<String>, Option<String>) {
    let base = sysfs_root.join("class/net").join(name);
    let read = |file: &str| {
        std::fs::read_to_string(base.join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    (read("mtu"), read("address"))
}

fn route_family(route: &str) -> &'static str {
    if route.contains(':') { "-6" } else { "-4" }
}

/// Adds static routes towards the container through `dev`.
///
/// # Errors
///
/// Returns an error if `ip` fails.
pub fn add_routes(dev: &str, routes: &[&str]) -> Result<()> {
    for &route in routes {
        let _ = run("ip", &[route_family(route), "route", "add", route, "dev", dev])?;
    }
    Ok(())
}

/// Removes static routes previously added through `dev`. Failures are logged.
pub fn remove_routes(dev: &str, routes: &[&str]) {
    for &route in routes {
        if let Err(e) = run("ip", &[route_family(route), "route", "flush", route, "dev", dev]) {
            tracing::warn!(dev, route, error = %e, "failed to remove route");
        }
    }
}

/// Splits a comma separated route list.
#[must_use]
pub fn parse_routes(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .collect()
}

/// Applies traffic limits on the host end of an interface.
///
/// From the container's point of view, `ingress` is traffic leaving the
/// host interface and `egress` is traffic entering it. Empty values lift
/// the corresponding limit.
///
/// # Errors
///
/// Returns an error for malformed rates or if `tc` fails.
pub fn set_limits(dev: &str, ingress: &str, egress: &str) -> Result<()> {
    let ingress_bps = (!ingress.is_empty()).then(|| parse_bit_rate(ingress)).transpose()?;
    let egress_bps = (!egress.is_empty()).then(|| parse_bit_rate(egress)).transpose()?;

    // Existing qdiscs may be absent.
    let _ = crate::command::exec("tc", &["qdisc", "del", "dev", dev, "root"]);
    let _ = crate::command::exec("tc", &["qdisc", "del", "dev", dev, "ingress"]);

    if let Some(bps) = ingress_bps {
        let rate = format!("{bps}bit");
        let _ = run("tc", &["qdisc", "add", "dev", dev, "root", "handle", "1:0", "htb", "default", "10"])?;
        let _ = run(
            "tc",
            &["class", "add", "dev", dev, "parent", "1:0", "classid", "1:10", "htb", "rate", &rate],
        )?;
    }
    if let Some(bps) = egress_bps {
        let rate = format!("{bps}bit");
        let _ = run("tc", &["qdisc", "add", "dev", dev, "ingress", "handle", "ffff:0"])?;
        let _ = run(
            "tc",
            &[
                "filter", "add", "dev", dev, "parent", "ffff:0", "protocol", "all", "u32", "match",
                "u32", "0", "0", "police", "rate", &rate, "burst", "1024k", "mtu", "64kb", "drop",
            ],
        )?;
    }
    tracing::debug!(dev, ingress, egress, "network limits applied");
    Ok(())
}

fn mac_filter_rules<'a>(dev: &'a str, hwaddr: &'a str) -> [[&'a str; 8]; 2] {
    [
        ["INPUT", "-s", "!", hwaddr, "-i", dev, "-j", "DROP"],
        ["FORWARD", "-s", "!", hwaddr, "-i", dev, "-j", "DROP"],
    ]
}

/// Installs rules dropping frames from `dev` whose source MAC is not `hwaddr`.
///
/// # Errors
///
/// Returns an error if `ebtables` fails.
pub fn add_mac_filter(dev: &str, hwaddr: &str) -> Result<()> {
    for rule in mac_filter_rules(dev, hwaddr) {
        let mut args = vec!["-A"];
        args.extend(rule);
        let _ = run("ebtables", &args)?;
    }
    Ok(())
}

/// Removes the MAC filtering rules of `dev`. Failures are logged.
pub fn remove_mac_filter(dev: &str, hwaddr: &str) {
    for rule in mac_filter_rules(dev, hwaddr) {
        let mut args = vec!["-D"];
        args.extend(rule);
        if let Err(e) = run("ebtables", &args) {
            tracing::warn!(dev, error = %e, "failed to remove MAC filter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_are_unique_and_prefixed() {
        let a = random_veth_name();
        let b = random_veth_name();
        assert!(a.starts_with("veth"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn hwaddr_uses_reserved_prefix() {
        let mac = random_hwaddr();
        assert!(mac.starts_with("00:16:3e:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn next_name_skips_taken() {
        assert_eq!(next_interface_name([]), "eth0");
        assert_eq!(next_interface_name(["eth0", "eth2"]), "eth1");
    }

    #[test]
    fn routes_are_split_and_trimmed() {
        assert_eq!(
            parse_routes("10.0.0.0/24, 2001:db8::/64,"),
            vec!["10.0.0.0/24", "2001:db8::/64"]
        );
        assert_eq!(route_family("2001:db8::/64"), "-6");
    }

    #[test]
    fn interface_existence_uses_sysfs_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("class/net/br0")).expect("mkdir");
        std::fs::write(dir.path().join("class/net/br0/mtu"), "1500\n").expect("write");
        assert!(interface_exists(dir.path(), "br0"));
        assert!(!interface_exists(dir.path(), "br1"));
        assert_eq!(
            link_properties(dir.path(), "br0"),
            (Some("1500".to_string()), None)
        );
    }

    #[test]
    fn bad_rates_are_rejected_before_touching_tc() {
        assert!(set_limits("veth0", "fast", "").is_err());
    }
}
