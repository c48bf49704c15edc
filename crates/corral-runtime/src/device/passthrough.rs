//! `usb` and `gpu` devices, matched against the host inventory and
//! exposed as unix character devices.

use corral_common::device::Device;
use corral_common::error::{CorralError, Result};
use corral_core::devnode::{self, DeviceNode, NodeType};
use corral_core::inventory::{GpuDevice, UsbDevice, gpu_devices, usb_devices};

use super::unix::{self, NodeSpec};
use super::{DeviceContext, DeviceHandler, DeviceOutcome, Phase};

fn node_mode(device: &Device) -> Result<u32> {
    device.get("mode").map_or(Ok(0o660), devnode::parse_mode)
}

fn char_node(major: u32, minor: u32, mode: u32) -> DeviceNode {
    DeviceNode {
        node_type: NodeType::Char,
        major,
        minor,
        mode,
    }
}

fn add_all(ctx: &DeviceContext<'_>, name: &str, specs: &[NodeSpec], phase: Phase) -> Result<DeviceOutcome> {
    let mut outcome = DeviceOutcome::default();
    for spec in specs {
        outcome.merge(unix::add_node(ctx, name, spec, phase)?);
    }
    Ok(outcome)
}

/// Nodes of the USB devices matching `device`.
///
/// # Errors
///
/// Returns a validation error for malformed owner or mode keys.
pub fn usb_nodes(device: &Device, inventory: &[UsbDevice]) -> Result<Vec<NodeSpec>> {
    let (uid, gid) = unix::owner(device)?;
    let mode = node_mode(device)?;
    Ok(inventory
        .iter()
        .filter(|usb| usb.matches(device.value("vendorid"), device.value("productid")))
        .map(|usb| NodeSpec {
            target: format!("/{}", usb.node_path()),
            node: char_node(usb.major, usb.minor, mode),
            uid,
            gid,
        })
        .collect())
}

/// Nodes of the GPUs matching `device`.
///
/// # Errors
///
/// Returns a validation error for malformed owner or mode keys.
pub fn gpu_nodes(device: &Device, inventory: &[GpuDevice]) -> Result<Vec<NodeSpec>> {
    let (uid, gid) = unix::owner(device)?;
    let mode = node_mode(device)?;
    Ok(inventory
        .iter()
        .filter(|gpu| {
            gpu.matches(
                device.value("vendorid"),
                device.value("productid"),
                device.value("id"),
                device.value("pci"),
            )
        })
        .flat_map(|gpu| gpu.nodes.iter())
        .map(|drm| NodeSpec {
            target: format!("/{}", drm.node_path()),
            node: char_node(drm.major, drm.minor, mode),
            uid,
            gid,
        })
        .collect())
}

/// Handler of `usb` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbHandler;

impl DeviceHandler for UsbHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        let specs = usb_nodes(device, &usb_devices(&ctx.driver.sysfs_root))?;
        if specs.is_empty() {
            if device.is_true("required") {
                return Err(CorralError::NotFound {
                    kind: "USB device",
                    id: format!("{}:{}", device.value("vendorid"), device.value("productid")),
                });
            }
            tracing::info!(container = ctx.container, device = name, "no matching USB device present");
        }
        add_all(ctx, name, &specs, phase)
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, _device: &Device) -> Result<DeviceOutcome> {
        unix::remove_prefixed(ctx, name)?;
        Ok(DeviceOutcome::default())
    }
}

/// Handler of `gpu` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuHandler;

impl DeviceHandler for GpuHandler {
    fn attach(&self, ctx: &DeviceContext<'_>, name: &str, device: &Device, phase: Phase) -> Result<DeviceOutcome> {
        let specs = gpu_nodes(device, &gpu_devices(&ctx.driver.sysfs_root))?;
        if specs.is_empty() {
            return Err(CorralError::NotFound {
                kind: "GPU device",
                id: name.to_string(),
            });
        }
        add_all(ctx, name, &specs, phase)
    }

    fn detach(&self, ctx: &DeviceContext<'_>, name: &str, _device: &Device) -> Result<DeviceOutcome> {
        unix::remove_prefixed(ctx, name)?;
        Ok(DeviceOutcome::default())
    }
}
