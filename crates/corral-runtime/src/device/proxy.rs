//! `proxy` devices: a helper listener forwarding between the host and the
//! container, or NAT rules when `nat=true`.
//!
//! `bind` picks the listening side. With `bind=host` the helper listens on
//! the host and connects inside the container; with `bind=container` it
//! listens inside the container and connects on the host.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use corral_common::device::Device;
use corral_common::error::{CorralError, Result};
use corral_core::process::{read_pid_file, terminate};

use super::{DeviceContext, DeviceHandler, DeviceOutcome, Phase};
use crate::network::NatRule;

/// One side of a proxy: `tcp:<addr>:<port>`, `udp:<addr>:<port>` or
/// `unix:<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    /// `tcp`, `udp` or `unix`.
    pub protocol: String,
    /// Host or path.
    pub address: String,
    /// Port or port range; empty for unix sockets.
    pub port: String,
}

impl ProxyAddress {
    /// Parses a proxy address.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown protocols or missing ports.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || CorralError::validation(format!("invalid proxy address: {value:?}"));
        let (protocol, rest) = value.split_once(':').ok_or_else(invalid)?;
        match protocol {
            "unix" if !rest.is_empty() => Ok(Self {
                protocol: protocol.into(),
                address: rest.into(),
                port: String::new(),
            }),
            "tcp" | "udp" => {
                let (address, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                if port.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    protocol: protocol.into(),
                    address: address.trim_start_matches('[').trim_end_matches(']').into(),
                    port: port.into(),
                })
            }
            _ => Err(invalid()),
        }
    }

    fn wildcard(&self) -> bool {
        matches!(self.address.as_str(), "" | "0.0.0.0" | "::")
    }

    /// Listening side. A unix socket under `root` is created through
    /// `/proc/<pid>/root` of the container.
    fn listen_spec(&self, root: Option<u32>) -> String {
        match (self.protocol.as_str(), root) {
            ("unix", Some(pid)) => format!("UNIX-LISTEN:/proc/{pid}/root{},fork,unlink-early", self.address),
            ("unix", None) => format!("UNIX-LISTEN:{},fork,unlink-early", self.address),
            (proto, _) => format!(
                "{}-LISTEN:{},bind={},reuseaddr,fork",
                proto.to_uppercase(),
                self.port,
                self.address
            ),
        }
    }

    /// Connecting side on the host. `from_container` is set when the helper
    /// runs in the container's network namespace and must step back into
    /// the host's (pid 1) to reach a network address.
    fn host_connect_spec(&self, from_container: bool) -> String {
        match self.protocol.as_str() {
            "unix" => format!("UNIX-CONNECT:{}", self.address),
            proto if from_container => format!(
                "EXEC:nsenter -t 1 -n socat STDIO {}:{}:{}",
                proto.to_uppercase(),
                self.address,
                self.port
            ),
            proto => format!("{}:{}:{}", proto.to_uppercase(), self.address, self.port),
        }
    }

    fn connect_spec(&self, pid: u32) -> String {
        match self.protocol.as_str() {
            "unix" => format!("EXEC:nsenter -t {pid} -m socat STDIO UNIX-CONNECT:{}", self.address),
            proto => format!(
                "EXEC:nsenter -t {pid} -n socat STDIO {}:{}:{}",
                proto.to_uppercase(),
                self.address,
                self.port
            ),
        }
    }
}

/// Which side of a proxy listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyBind {
    /// Listen on the host, connect in the container.
    #[default]
    Host,
    /// Listen in the container, connect on the host.
    Container,
}

impl ProxyBind {
    /// Parses the `bind` key; empty means `host`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for other values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "host" => Ok(Self::Host),
            "container" => Ok(Self::Container),
            other => Err(CorralError::validation(format!("invalid proxy bind: {other:?}"))),
        }
    }
}

/// Program and arguments of a proxy helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    /// Binary to run.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
}

/// Command line forwarding `listen` to `connect` for the container whose
/// init is `pid`, running `helper` on the side `bind` selects.
#[must_use]
pub fn helper_command(
    helper: &str,
    bind: ProxyBind,
    listen: &ProxyAddress,
    connect: &ProxyAddress,
    pid: u32,
) -> HelperCommand {
    match bind {
        ProxyBind::Host => HelperCommand {
            program: helper.to_string(),
            args: vec![listen.listen_spec(None), connect.connect_spec(pid)],
        },
        ProxyBind::Container if listen.protocol == "unix" => HelperCommand {
            program: helper.to_string(),
            args: vec![listen.listen_spec(Some(pid)), connect.host_connect_spec(false)],
        },
        ProxyBind::Container => HelperCommand {
            program: "nsenter".to_string(),
            args: vec![
                "-t".to_string(),
                pid.to_string(),
                "-n".to_string(),
                helper.to_string(),
                listen.listen_spec(None),
                connect.host_connect_spec(true),
            ],
        },
    }
}

fn owner(ctx: &DeviceContext<'_>, name: &str) -> String {
    format!("{}/{name}", ctx.container)
}

fn pid_file(ctx: &DeviceContext<'_>, name: &str) -> PathBuf {
    ctx.devices_dir.join(format!("proxy.{name}"))
}

/// Stops the helper of a proxy device, if any, and removes its pid file.
///
/// # Errors
///
/// Returns an error if the helper cannot be signalled.
pub fn stop_helper(ctx: &DeviceContext<'_>, name: &str) -> Result<()> {
    let path = pid_file(ctx, name);
    if !path.exists() {
        return Ok(());
    }
    if let Ok(pid) = read_pid_file(&path) {
        terminate(pid, ctx.driver.helper_kill_timeout())?;
    }
    std::fs::remove_file(&path).map_err(|e| CorralError::Io { path, source: e })
}

/// Handler of `proxy` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyHandler;

impl ProxyHandler {
    fn nat_rule(ctx: &DeviceContext<'_>, name: &str, listen: &ProxyAddress, connect: &ProxyAddress) -> Result<NatRule> {
        if listen.protocol == "unix" || listen.protocol != connect.protocol {
            return Err(CorralError::validation(
                "NAT proxies need matching tcp or udp addresses on both sides",
            ));
        }
        if connect.wildcard() {
            return Err(CorralError::validation(
                "NAT proxies need a specific connect address",
            ));
        }
        Ok(NatRule {
            owner: owner(ctx, name),
            protocol: listen.protocol.clone(),
            listen_address: if listen.wildcard() {
                String::new()
            } else {
                listen.address.clone()
            },
            listen_port: listen.port.clone(),
            connect_address: connect.address.clone(),
            connect_port: connect.port.clone(),
        })
    }

    fn spawn(
        ctx: &DeviceContext<'_>,
        name: &str,
        bind: ProxyBind,
        listen: &ProxyAddress,
        connect: &ProxyAddress,
    ) -> Result<()> {
        let pid = ctx
            .live_handle()?
            .init_pid()
            .ok_or_else(|| CorralError::invalid_state("the container is not running"))?;
        ctx.ensure_devices_dir()?;
        stop_helper(ctx, name)?;

        let command = helper_command(&ctx.driver.proxy_helper, bind, listen, connect, pid);
        tracing::debug!(container = ctx.container, device = name, ?bind, program = %command.program, args = ?command.args, "starting proxy helper");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CorralError::external(format!("failed to start proxy helper for {name}"), e))?;
        let path = pid_file(ctx, name);
        let pid = child.id();
        let _ = std::thread::spawn(move || {
            let _ = child.wait();
        });
        std::fs::write(&path, pid.to_string()).map_err(|e| CorralError::Io { path, source: e })
    }
}

impl DeviceHandler for ProxyHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        if phase == Phase::Boot {
            return Ok(DeviceOutcome::default());
        }
        let listen = ProxyAddress::parse(device.value("listen"))?;
        let connect = ProxyAddress::parse(device.value("connect"))?;
        let bind = ProxyBind::parse(device.value("bind"))?;
        if device.is_true("nat") {
            if bind != ProxyBind::Host {
                return Err(CorralError::validation("only host-bound proxies can use NAT"));
            }
            ctx.network.add_nat(&Self::nat_rule(ctx, name, &listen, &connect)?)?;
        } else {
            Self::spawn(ctx, name, bind, &listen, &connect)?;
        }
        tracing::info!(container = ctx.container, device = name, listen = device.value("listen"), "proxy started");
        Ok(DeviceOutcome::default())
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> Result<DeviceOutcome> {
        if device.is_true("nat") {
            ctx.network.remove_nat(&owner(ctx, name));
        } else {
            stop_helper(ctx, name)?;
        }
        Ok(DeviceOutcome::default())
    }

    fn cleanup(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device) -> DeviceOutcome {
        if let Err(e) = self.detach(ctx, name, device) {
            tracing::warn!(container = ctx.container, device = name, error = %e, "failed to stop proxy");
        }
        DeviceOutcome::default()
    }
}
