//! `nic` and `infiniband` devices.
//!
//! Bridged and p2p interfaces are veth pairs whose host end stays on the
//! host; macvlan interfaces are created on a parent; physical and SR-IOV
//! interfaces are handed over as they are and get their host properties
//! back when the container releases them.

use std::fmt;
use std::str::FromStr;

use corral_common::constants::keys;
use corral_common::device::{Device, DeviceKind};
use corral_common::error::{CorralError, Result};
use corral_core::network::{next_interface_name, parse_routes, random_hwaddr, random_veth_name};

use super::{DeviceContext, DeviceHandler, DeviceOutcome, Phase};

/// How a nic is realized on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicType {
    /// Veth pair whose host end joins a bridge.
    Bridged,
    /// Veth pair whose host end stays unattached.
    P2p,
    /// Macvlan child of a parent interface.
    Macvlan,
    /// Host interface moved into the container.
    Physical,
    /// Virtual function moved into the container.
    Sriov,
}

impl NicType {
    /// Whether the host keeps one end of a veth pair.
    #[must_use]
    pub const fn is_veth(self) -> bool {
        matches!(self, Self::Bridged | Self::P2p)
    }

    /// Whether an existing host interface is handed over.
    #[must_use]
    pub const fn is_passthrough(self) -> bool {
        matches!(self, Self::Physical | Self::Sriov)
    }

    const fn runtime_type(self) -> &'static str {
        match self {
            Self::Bridged | Self::P2p => "veth",
            Self::Macvlan => "macvlan",
            Self::Physical | Self::Sriov => "phys",
        }
    }
}

impl FromStr for NicType {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bridged" => Ok(Self::Bridged),
            "p2p" => Ok(Self::P2p),
            "macvlan" => Ok(Self::Macvlan),
            "physical" => Ok(Self::Physical),
            "sriov" => Ok(Self::Sriov),
            other => Err(CorralError::validation(format!("invalid nictype: {other:?}"))),
        }
    }
}

impl fmt::Display for NicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bridged => "bridged",
            Self::P2p => "p2p",
            Self::Macvlan => "macvlan",
            Self::Physical => "physical",
            Self::Sriov => "sriov",
        })
    }
}

/// The `nictype` of a device.
///
/// # Errors
///
/// Returns a validation error for unknown or missing types.
pub fn nic_type(device: &Device) -> Result<NicType> {
    device.value("nictype").parse()
}

/// Interface name inside the container: configured, else volatile.
#[must_use]
pub fn interface_name<'a>(ctx: &DeviceContext<'a>, name: &str, device: &'a Device) -> &'a str {
    match device.value("name") {
        "" => ctx.volatile(name, "name"),
        configured => configured,
    }
}

/// Host end of a veth pair: configured, else volatile.
#[must_use]
pub fn host_name<'a>(ctx: &DeviceContext<'a>, name: &str, device: &'a Device) -> &'a str {
    match device.value("host_name") {
        "" => ctx.volatile(name, "host_name"),
        configured => configured,
    }
}

fn taken_names<'a>(ctx: &DeviceContext<'a>, name: &str) -> Vec<&'a str> {
    let mut taken: Vec<&str> = ctx
        .devices
        .iter()
        .filter(|(n, d)| *n != name && matches!(d.kind(), Ok(DeviceKind::Nic | DeviceKind::Infiniband)))
        .map(|(_, d)| d.value("name"))
        .filter(|n| !n.is_empty())
        .collect();
    let own = keys::volatile_device(name, "name");
    taken.extend(
        ctx.config
            .iter()
            .filter(|(k, _)| k.starts_with(keys::VOLATILE_PREFIX) && k.ends_with(".name") && **k != own)
            .map(|(_, v)| v.as_str()),
    );
    taken
}

/// Fills `name` and `hwaddr` from volatile keys, generating and
/// recording them when unset.
#[must_use]
pub fn fill_volatile(ctx: &DeviceContext<'_>, name: &str, device: &Device) -> (Device, DeviceOutcome) {
    let mut filled = device.clone();
    let mut outcome = DeviceOutcome::default();
    if device.value("name").is_empty() {
        let value = match ctx.volatile(name, "name") {
            "" => {
                let generated = next_interface_name(taken_names(ctx, name));
                outcome.set_volatile(name, "name", Some(generated.clone()));
                generated
            }
            stored => stored.to_string(),
        };
        let _ = filled.set("name", value);
    }
    let ethernet = device.get("type") == Some(DeviceKind::Nic.as_str());
    if ethernet && device.value("hwaddr").is_empty() {
        let value = match ctx.volatile(name, "hwaddr") {
            "" => {
                let generated = random_hwaddr();
                outcome.set_volatile(name, "hwaddr", Some(generated.clone()));
                generated
            }
            stored => stored.to_string(),
        };
        let _ = filled.set("hwaddr", value);
    }
    (filled, outcome)
}

fn runtime_index(ctx: &DeviceContext<'_>, name: &str) -> usize {
    ctx.devices
        .iter()
        .filter(|(_, d)| matches!(d.kind(), Ok(DeviceKind::Nic | DeviceKind::Infiniband)))
        .position(|(n, _)| n == name)
        .unwrap_or_default()
}

fn routes(device: &Device) -> Vec<&str> {
    let mut all = parse_routes(device.value("ipv4.routes"));
    all.extend(parse_routes(device.value("ipv6.routes")));
    all
}

fn limit<'a>(device: &'a Device, key: &str) -> &'a str {
    match device.value(key) {
        "" => device.value("limits.max"),
        value => value,
    }
}

fn has_limits(device: &Device) -> bool {
    ["limits.max", "limits.ingress", "limits.egress"]
        .iter()
        .any(|k| !device.value(k).is_empty())
}

fn check_parent(ctx: &DeviceContext<'_>, device: &Device) -> Result<()> {
    let parent = device.value("parent");
    if !parent.is_empty() && !ctx.network.interface_exists(parent) {
        return Err(CorralError::validation(format!("parent device '{parent}' doesn't exist")));
    }
    Ok(())
}

/// Applies limits and routes on the host end of a veth.
fn setup_host_side(ctx: &DeviceContext<'_>, host: &str, device: &Device) -> Result<()> {
    if has_limits(device) {
        ctx.network
            .set_limits(host, limit(device, "limits.ingress"), limit(device, "limits.egress"))?;
    }
    let routes = routes(device);
    if !routes.is_empty() {
        ctx.network.add_routes(host, &routes)?;
    }
    Ok(())
}

/// Records the host properties of a handed-over interface.
fn save_host_properties(ctx: &DeviceContext<'_>, name: &str, parent: &str, outcome: &mut DeviceOutcome) {
    let (mtu, hwaddr) = ctx.network.link_properties(parent);
    outcome.set_volatile(name, "last_state.mtu", mtu);
    outcome.set_volatile(name, "last_state.hwaddr", hwaddr);
}

/// Restores the host properties of a handed-over interface once the
/// container gave it back. Failures are logged.
#[must_use]
pub fn restore_host_properties(ctx: &DeviceContext<'_>, name: &str, device: &Device) -> DeviceOutcome {
    let mut outcome = DeviceOutcome::default();
    let parent = device.value("parent");
    let mtu = ctx.volatile(name, "last_state.mtu");
    if !mtu.is_empty() {
        if let Err(e) = ctx.network.set_mtu(parent, mtu) {
            tracing::warn!(container = ctx.container, device = name, error = %e, "failed to restore MTU");
        }
    }
    let hwaddr = ctx.volatile(name, "last_state.hwaddr");
    if !hwaddr.is_empty() {
        if let Err(e) = ctx.network.set_hwaddr(parent, hwaddr) {
            tracing::warn!(container = ctx.container, device = name, error = %e, "failed to restore MAC address");
        }
    }
    outcome.set_volatile(name, "last_state.mtu", None);
    outcome.set_volatile(name, "last_state.hwaddr", None);
    outcome
}

/// Host side of a veth came up: remember its name and apply limits and
/// routes.
///
/// # Errors
///
/// Returns an error if limits or routes are rejected.
pub fn network_up(ctx: &DeviceContext<'_>, name: &str, device: &Device, host: &str) -> Result<DeviceOutcome> {
    let mut outcome = DeviceOutcome::default();
    if host.is_empty() {
        return Err(CorralError::validation(format!(
            "no host side interface known for device {name}"
        )));
    }
    if device.value("host_name").is_empty() {
        outcome.set_volatile(name, "host_name", Some(host.to_string()));
    }
    setup_host_side(ctx, host, device)?;
    tracing::debug!(container = ctx.container, device = name, host, "host side interface configured");
    Ok(outcome)
}

/// Handler of `nic` and `infiniband` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NicHandler;

impl NicHandler {
    fn boot(ctx: &DeviceContext<'_>, name: &str, device: &Device, outcome: &mut DeviceOutcome) -> Result<()> {
        let kind = nic_type(device)?;
        let index = runtime_index(ctx, name);
        let mut item = |key: &str, value: &str| {
            if !value.is_empty() {
                outcome.item(format!("lxc.net.{index}.{key}"), value);
            }
        };
        item("type", kind.runtime_type());
        item("flags", "up");
        if kind != NicType::P2p {
            item("link", device.value("parent"));
        }
        if kind == NicType::Macvlan {
            item("macvlan.mode", "bridge");
        }
        let mut pair = device.value("host_name").to_string();
        if kind.is_veth() {
            if pair.is_empty() && device.is_true("security.mac_filtering") {
                pair = random_veth_name();
            }
            item("veth.pair", &pair);
            if let Some(hook) = ctx.runtime.network_up_hook(ctx.container, name) {
                item("script.up", &hook);
            }
        }
        item("hwaddr", device.value("hwaddr"));
        item("name", device.value("name"));
        item("mtu", device.value("mtu"));
        if kind.is_passthrough() {
            save_host_properties(ctx, name, device.value("parent"), outcome);
        }
        Ok(())
    }

    fn live(ctx: &DeviceContext<'_>, name: &str, device: &Device, outcome: &mut DeviceOutcome) -> Result<()> {
        let handle = ctx.live_handle()?;
        let kind = nic_type(device)?;
        let parent = device.value("parent");
        let mut created: Option<String> = None;
        let mut host = String::new();
        let dev = match kind {
            NicType::Bridged | NicType::P2p => {
                host = match device.value("host_name") {
                    "" => random_veth_name(),
                    configured => configured.to_string(),
                };
                let peer = random_veth_name();
                ctx.network.create_veth(&host, &peer)?;
                created = Some(host.clone());
                if kind == NicType::Bridged {
                    if let Err(e) = ctx.network.attach_to_bridge(&host, parent) {
                        let _ = ctx.network.delete_link(&host);
                        return Err(e);
                    }
                }
                peer
            }
            NicType::Macvlan => {
                let link = random_veth_name();
                ctx.network.create_macvlan(&link, parent)?;
                created = Some(link.clone());
                link
            }
            NicType::Physical | NicType::Sriov => {
                save_host_properties(ctx, name, parent, outcome);
                parent.to_string()
            }
        };

        let result = (|| -> Result<()> {
            let hwaddr = device.value("hwaddr");
            if !hwaddr.is_empty() {
                ctx.network.set_hwaddr(&dev, hwaddr)?;
            }
            let mtu = device.value("mtu");
            if !mtu.is_empty() {
                ctx.network.set_mtu(&dev, mtu)?;
            }
            if kind == NicType::Bridged && device.is_true("security.mac_filtering") {
                ctx.network.add_mac_filter(&host, hwaddr)?;
            }
            handle.attach_interface(&dev, device.value("name"))?;
            if kind.is_veth() {
                setup_host_side(ctx, &host, device)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            if let Some(link) = created {
                let _ = ctx.network.delete_link(&link);
            }
            return Err(e);
        }
        if kind.is_veth() && device.value("host_name").is_empty() {
            outcome.set_volatile(name, "host_name", Some(host));
        }
        Ok(())
    }
}

impl DeviceHandler for NicHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        check_parent(ctx, device)?;
        let (filled, mut outcome) = fill_volatile(ctx, name, device);
        match phase {
            Phase::Boot => Self::boot(ctx, name, &filled, &mut outcome)?,
            Phase::Live => Self::live(ctx, name, &filled, &mut outcome)?,
        }
        tracing::debug!(container = ctx.container, device = name, ?phase, "network device attached");
        Ok(outcome)
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<DeviceOutcome> {
        let handle = ctx.live_handle()?;
        let kind = nic_type(device)?;
        let inside = interface_name(ctx, name, device);
        let host = host_name(ctx, name, device);
        let temporary = if kind.is_passthrough() {
            device.value("parent").to_string()
        } else {
            random_veth_name()
        };
        handle.detach_interface(inside, &temporary)?;

        let mut outcome = DeviceOutcome::default();
        if kind.is_passthrough() {
            outcome.merge(restore_host_properties(ctx, name, device));
            return Ok(outcome);
        }
        ctx.network.delete_link(&temporary)?;
        if kind.is_veth() && !host.is_empty() {
            let routes = routes(device);
            if !routes.is_empty() {
                ctx.network.remove_routes(host, &routes);
            }
            if device.is_true("security.mac_filtering") {
                let hwaddr = match device.value("hwaddr") {
                    "" => ctx.volatile(name, "hwaddr"),
                    configured => configured,
                };
                ctx.network.remove_mac_filter(host, hwaddr);
            }
            ctx.network.delete_link(host)?;
            outcome.set_volatile(name, "host_name", None);
        }
        tracing::debug!(container = ctx.container, device = name, host, "network device detached");
        Ok(outcome)
    }

    fn update(
        &self,
        ctx: &DeviceContext<'_>,
        name: &str,
        old: &Device,
        new: &Device,
        changed: &[String],
    ) -> Result<DeviceOutcome> {
        let kind = nic_type(new)?;
        let host = host_name(ctx, name, new);
        let touches = |prefix: &str| changed.iter().any(|k| k.starts_with(prefix));
        if touches("limits.") {
            if !kind.is_veth() {
                return Err(CorralError::validation(format!(
                    "network limits are only supported on bridged and p2p interfaces, not {kind}"
                )));
            }
            if host.is_empty() {
                return Err(CorralError::invalid_state(format!(
                    "no host side interface known for device {name}"
                )));
            }
            ctx.network
                .set_limits(host, limit(new, "limits.ingress"), limit(new, "limits.egress"))?;
        }
        if kind.is_veth() && !host.is_empty() && (touches("ipv4.routes") || touches("ipv6.routes")) {
            ctx.network.remove_routes(host, &routes(old));
            let added = routes(new);
            if !added.is_empty() {
                ctx.network.add_routes(host, &added)?;
            }
        }
        Ok(DeviceOutcome::default())
    }

    fn cleanup(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> DeviceOutcome {
        let mut outcome = DeviceOutcome::default();
        let Ok(kind) = nic_type(device) else {
            return outcome;
        };
        let host = host_name(ctx, name, device);
        if !kind.is_veth() || host.is_empty() {
            return outcome;
        }
        let routes = routes(device);
        if !routes.is_empty() {
            ctx.network.remove_routes(host, &routes);
        }
        if device.is_true("security.mac_filtering") {
            ctx.network.remove_mac_filter(host, ctx.volatile(name, "hwaddr"));
        }
        if device.value("host_name").is_empty() {
            outcome.set_volatile(name, "host_name", None);
        }
        outcome
    }
}
