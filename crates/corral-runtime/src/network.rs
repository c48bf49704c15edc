//! Host network collaborator.
//!
//! Interface creation, traffic shaping, filtering, NAT and DHCP lease
//! bookkeeping happen on the host, outside any container. Device handlers
//! reach them through [`NetworkPlumbing`].

use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_core::command::run;
use corral_core::network;

/// A NAT forwarding rule installed for a proxy device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Rule owner, used as the comment that identifies it.
    pub owner: String,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Host address to match, empty for any.
    pub listen_address: String,
    /// Host port or range.
    pub listen_port: String,
    /// Container address.
    pub connect_address: String,
    /// Container port or range.
    pub connect_port: String,
}

/// Host-side network operations.
pub trait NetworkPlumbing: Send + Sync {
    /// Whether a host interface exists.
    fn interface_exists(&self, name: &str) -> bool;

    /// Creates a veth pair with the host end up.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created.
    fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()>;

    /// Creates a macvlan child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be created.
    fn create_macvlan(&self, name: &str, parent: &str) -> Result<()>;

    /// Attaches an interface to a bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge refuses the port.
    fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()>;

    /// Deletes an interface; missing interfaces are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing interface cannot be removed.
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Sets the MTU of an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the MTU is rejected.
    fn set_mtu(&self, name: &str, mtu: &str) -> Result<()>;

    /// Sets the MAC address of an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is rejected.
    fn set_hwaddr(&self, name: &str, hwaddr: &str) -> Result<()>;

    /// Current MTU and MAC address of an interface.
    fn link_properties(&self, name: &str) -> (Option<String>, Option<String>);

    /// Applies ingress/egress limits; empty values remove them.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed rates or rejected qdiscs.
    fn set_limits(&self, host_name: &str, ingress: &str, egress: &str) -> Result<()>;

    /// Adds static routes through `dev`.
    ///
    /// # Errors
    ///
    /// Returns an error if a route is rejected.
    fn add_routes(&self, dev: &str, routes: &[&str]) -> Result<()>;

    /// Removes static routes through `dev`, logging failures.
    fn remove_routes(&self, dev: &str, routes: &[&str]);

    /// Drops frames from `dev` not sourced from `hwaddr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be installed.
    fn add_mac_filter(&self, dev: &str, hwaddr: &str) -> Result<()>;

    /// Removes MAC filtering of `dev`, logging failures.
    fn remove_mac_filter(&self, dev: &str, hwaddr: &str);

    /// Installs a NAT forwarding rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn add_nat(&self, rule: &NatRule) -> Result<()>;

    /// Removes every NAT rule owned by `owner`, logging failures.
    fn remove_nat(&self, owner: &str);

    /// Drops the DHCP leases of a container on a managed bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease file cannot be rewritten.
    fn clear_leases(&self, network: &str, container: &str, hwaddr: &str) -> Result<()>;
}

/// [`NetworkPlumbing`] through `ip`, `tc`, `ebtables` and `iptables`.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    sysfs_root: PathBuf,
    networks_dir: PathBuf,
}

impl HostNetwork {
    /// Creates host plumbing reading interfaces from `sysfs_root` and
    /// DHCP leases from `<data_dir>/networks`.
    #[must_use]
    pub fn new(sysfs_root: &Path, data_dir: &Path) -> Self {
        Self {
            sysfs_root: sysfs_root.to_path_buf(),
            networks_dir: data_dir.join("networks"),
        }
    }

    fn nat_args<'a>(action: &'a str, rule: &'a NatRule, comment: &'a str) -> Vec<&'a str> {
        let mut args = vec!["-t", "nat", action, "PREROUTING", "-p", rule.protocol.as_str()];
        if !rule.listen_address.is_empty() {
            args.extend(["-d", rule.listen_address.as_str()]);
        }
        args.extend([
            "--dport",
            rule.listen_port.as_str(),
            "-m",
            "comment",
            "--comment",
            comment,
            "-j",
            "DNAT",
            "--to-destination",
        ]);
        args
    }
}

fn nat_comment(owner: &str) -> String {
    format!("corral {owner}")
}

/// Removes lease lines mentioning `hwaddr` or `container` from a dnsmasq lease file.
fn filter_leases(content: &str, container: &str, hwaddr: &str) -> String {
    content
        .lines()
        .filter(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let mac_match = fields
                .get(1)
                .is_some_and(|mac| !hwaddr.is_empty() && mac.eq_ignore_ascii_case(hwaddr));
            let name_match = fields.get(3).is_some_and(|name| *name == container);
            !(mac_match || name_match)
        })
        .map(|line| format!("{line}\n"))
        .collect()
}

impl NetworkPlumbing for HostNetwork {
    fn interface_exists(&self, name: &str) -> bool {
        network::interface_exists(&self.sysfs_root, name)
    }

    fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()> {
        network::create_veth(host_name, peer_name)
    }

    fn create_macvlan(&self, name: &str, parent: &str) -> Result<()> {
        network::create_macvlan(name, parent)
    }

    fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        network::attach_to_bridge(name, bridge)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        network::delete_link(&self.sysfs_root, name)
    }

    fn set_mtu(&self, name: &str, mtu: &str) -> Result<()> {
        network::set_mtu(name, mtu)
    }

    fn set_hwaddr(&self, name: &str, hwaddr: &str) -> Result<()> {
        network::set_hwaddr(name, hwaddr)
    }

    fn link_properties(&self, name: &str) -> (Option<String>, Option<String>) {
        network::link_properties(&self.sysfs_root, name)
    }

    fn set_limits(&self, host_name: &str, ingress: &str, egress: &str) -> Result<()> {
        network::set_limits(host_name, ingress, egress)
    }

    fn add_routes(&self, dev: &str, routes: &[&str]) -> Result<()> {
        network::add_routes(dev, routes)
    }

    fn remove_routes(&self, dev: &str, routes: &[&str]) {
        network::remove_routes(dev, routes);
    }

    fn add_mac_filter(&self, dev: &str, hwaddr: &str) -> Result<()> {
        network::add_mac_filter(dev, hwaddr)
    }

    fn remove_mac_filter(&self, dev: &str, hwaddr: &str) {
        network::remove_mac_filter(dev, hwaddr);
    }

    fn add_nat(&self, rule: &NatRule) -> Result<()> {
        let comment = nat_comment(&rule.owner);
        let destination = format!("{}:{}", rule.connect_address, rule.connect_port.replace('-', ":"));
        let mut args = Self::nat_args("-A", rule, &comment);
        args.push(&destination);
        let _ = run("iptables", &args)?;
        Ok(())
    }

    fn remove_nat(&self, owner: &str) {
        let comment = nat_comment(owner);
        let rules = match run("iptables", &["-t", "nat", "-S", "PREROUTING"]) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(owner, error = %e, "failed to list NAT rules");
                return;
            }
        };
        for rule in rules.lines().filter(|r| r.contains(&format!("\"{comment}\""))) {
            let Some(spec) = rule.strip_prefix("-A ") else {
                continue;
            };
            let mut args = vec!["-t".to_string(), "nat".to_string(), "-D".to_string()];
            args.extend(spec.split_whitespace().map(|a| a.trim_matches('"').to_string()));
            if let Err(e) = run("iptables", &args) {
                tracing::warn!(owner, error = %e, "failed to remove NAT rule");
            }
        }
    }

    fn clear_leases(&self, network: &str, container: &str, hwaddr: &str) -> Result<()> {
        let path = self.networks_dir.join(network).join("dnsmasq.leases");
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| CorralError::Io {
            path: path.clone(),
            source: e,
        })?;
        std::fs::write(&path, filter_leases(&content, container, hwaddr))
            .map_err(|e| CorralError::Io { path, source: e })?;
        tracing::debug!(network, container, "DHCP leases cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = "\
1700000000 00:16:3e:aa:bb:cc 10.0.3.10 web *
1700000000 00:16:3e:11:22:33 10.0.3.11 db *
1700000000 00:16:3e:44:55:66 10.0.3.12 old-web *
";

    #[test]
    fn leases_are_filtered_by_mac_and_name() {
        let out = filter_leases(LEASES, "db", "00:16:3E:AA:BB:CC");
        assert_eq!(out, "1700000000 00:16:3e:44:55:66 10.0.3.12 old-web *\n");
    }

    #[test]
    fn clear_leases_rewrites_the_lease_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let net = HostNetwork::new(&dir.path().join("sys"), dir.path());
        let leases = dir.path().join("networks/lxdbr0/dnsmasq.leases");
        std::fs::create_dir_all(leases.parent().expect("parent")).expect("mkdir");
        std::fs::write(&leases, LEASES).expect("write");

        net.clear_leases("lxdbr0", "web", "").expect("clear");
        let content = std::fs::read_to_string(&leases).expect("read");
        assert!(!content.contains(" web "));
        assert_eq!(content.lines().count(), 2);
        net.clear_leases("missing", "web", "").expect("no lease file");
    }

    #[test]
    fn nat_rules_carry_the_owner_comment() {
        let rule = NatRule {
            owner: "web/http".into(),
            protocol: "tcp".into(),
            listen_address: String::new(),
            listen_port: "80".into(),
            connect_address: "10.0.3.10".into(),
            connect_port: "8080".into(),
        };
        let comment = nat_comment(&rule.owner);
        let args = HostNetwork::nat_args("-A", &rule, &comment);
        assert_eq!(&args[..6], ["-t", "nat", "-A", "PREROUTING", "-p", "tcp"]);
        assert!(args.contains(&"corral web/http"));
        assert!(!args.contains(&"-d"));
    }
}
