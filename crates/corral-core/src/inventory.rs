//! Host USB and GPU inventory read from sysfs.

use std::path::{Path, PathBuf};

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_dev(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    paths
}

/// A USB device present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// `idVendor`, lower-case hex.
    pub vendor: String,
    /// `idProduct`, lower-case hex.
    pub product: String,
    /// Bus number.
    pub bus: u32,
    /// Device number on the bus.
    pub device: u32,
    /// Character device major.
    pub major: u32,
    /// Character device minor.
    pub minor: u32,
}

impl UsbDevice {
    /// Device node path, relative to `/`: `dev/bus/usb/BBB/DDD`.
    #[must_use]
    pub fn node_path(&self) -> String {
        format!("dev/bus/usb/{:03}/{:03}", self.bus, self.device)
    }

    /// Whether this device matches a `vendorid`/`productid` filter.
    /// Empty filter values match anything.
    #[must_use]
    pub fn matches(&self, vendor: &str, product: &str) -> bool {
        (vendor.is_empty() || vendor.eq_ignore_ascii_case(&self.vendor))
            && (product.is_empty() || product.eq_ignore_ascii_case(&self.product))
    }
}

/// Lists USB devices under `<sysfs>/bus/usb/devices`.
///
/// Interfaces and entries without a device node are skipped.
#[must_use]
pub fn usb_devices(sysfs_root: &Path) -> Vec<UsbDevice> {
    entries(&sysfs_root.join("bus/usb/devices"))
        .into_iter()
        .filter_map(|dir| {
            let (major, minor) = parse_dev(&read_attr(&dir, "dev")?)?;
            Some(UsbDevice {
                vendor: read_attr(&dir, "idVendor")?.to_lowercase(),
                product: read_attr(&dir, "idProduct")?.to_lowercase(),
                bus: read_attr(&dir, "busnum")?.parse().ok()?,
                device: read_attr(&dir, "devnum")?.parse().ok()?,
                major,
                minor,
            })
        })
        .collect()
}

/// A DRM node belonging to a GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmNode {
    /// Node name such as `card0` or `renderD128`.
    pub name: String,
    /// Character device major.
    pub major: u32,
    /// Character device minor.
    pub minor: u32,
}

impl DrmNode {
    /// Device node path, relative to `/`.
    #[must_use]
    pub fn node_path(&self) -> String {
        format!("dev/dri/{}", self.name)
    }
}

/// A display controller present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// PCI address, for example `0000:00:02.0`.
    pub pci: String,
    /// PCI vendor id without the `0x` prefix.
    pub vendor: String,
    /// PCI device id without the `0x` prefix.
    pub product: String,
    /// DRM minor of the primary card node, used as the GPU id.
    pub id: Option<u32>,
    /// Card and render nodes.
    pub nodes: Vec<DrmNode>,
}

impl GpuDevice {
    /// Whether this GPU matches the `vendorid`/`productid`/`id`/`pci` filters.
    #[must_use]
    pub fn matches(&self, vendor: &str, product: &str, id: &str, pci: &str) -> bool {
        (vendor.is_empty() || vendor.eq_ignore_ascii_case(&self.vendor))
            && (product.is_empty() || product.eq_ignore_ascii_case(&self.product))
            && (pci.is_empty() || pci == self.pci)
            && (id.is_empty() || self.id.is_some_and(|n| n.to_string() == id))
    }
}

fn strip_hex(value: &str) -> String {
    value.trim_start_matches("0x").to_lowercase()
}

/// Lists display controllers (PCI class `0x03xxxx`) with DRM nodes.
#[must_use]
pub fn gpu_devices(sysfs_root: &Path) -> Vec<GpuDevice> {
    entries(&sysfs_root.join("bus/pci/devices"))
        .into_iter()
        .filter_map(|dir| {
            if !read_attr(&dir, "class")?.starts_with("0x03") {
                return None;
            }
            let nodes: Vec<DrmNode> = entries(&dir.join("drm"))
                .into_iter()
                .filter_map(|node| {
                    let name = node.file_name()?.to_string_lossy().to_string();
                    if !name.starts_with("card") && !name.starts_with("renderD") {
                        return None;
                    }
                    let (major, minor) = parse_dev(&read_attr(&node, "dev")?)?;
                    Some(DrmNode { name, major, minor })
                })
                .collect();
            let id = nodes
                .iter()
                .find(|n| n.name.starts_with("card"))
                .map(|n| n.minor);
            Some(GpuDevice {
                pci: dir.file_name()?.to_string_lossy().to_string(),
                vendor: strip_hex(&read_attr(&dir, "vendor")?),
                product: strip_hex(&read_attr(&dir, "device")?),
                id,
                nodes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, value: &str) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join(name), value).expect("write");
    }

    #[test]
    fn lists_usb_devices_with_nodes() {
        let sys = tempfile::tempdir().expect("tempdir");
        let dev = sys.path().join("bus/usb/devices/1-1");
        write(&dev, "idVendor", "046D\n");
        write(&dev, "idProduct", "c52b\n");
        write(&dev, "busnum", "1\n");
        write(&dev, "devnum", "4\n");
        write(&dev, "dev", "189:3\n");
        // Interfaces carry no device node.
        write(&sys.path().join("bus/usb/devices/1-1:1.0"), "bInterfaceClass", "03");

        let devices = usb_devices(sys.path());
        assert_eq!(devices.len(), 1);
        let usb = &devices[0];
        assert_eq!(usb.node_path(), "dev/bus/usb/001/004");
        assert_eq!((usb.major, usb.minor), (189, 3));
        assert!(usb.matches("046d", ""));
        assert!(!usb.matches("046d", "0001"));
    }

    #[test]
    fn lists_display_controllers_only() {
        let sys = tempfile::tempdir().expect("tempdir");
        let gpu = sys.path().join("bus/pci/devices/0000:00:02.0");
        write(&gpu, "class", "0x030000\n");
        write(&gpu, "vendor", "0x8086\n");
        write(&gpu, "device", "0x3e92\n");
        write(&gpu.join("drm/card0"), "dev", "226:0\n");
        write(&gpu.join("drm/renderD128"), "dev", "226:128\n");
        let nic = sys.path().join("bus/pci/devices/0000:00:1f.6");
        write(&nic, "class", "0x020000\n");

        let gpus = gpu_devices(sys.path());
        assert_eq!(gpus.len(), 1);
        let gpu = &gpus[0];
        assert_eq!(gpu.id, Some(0));
        assert_eq!(gpu.nodes.len(), 2);
        assert_eq!(gpu.nodes[1].node_path(), "dev/dri/renderD128");
        assert!(gpu.matches("8086", "", "0", ""));
        assert!(!gpu.matches("", "", "1", ""));
        assert!(gpu.matches("", "", "", "0000:00:02.0"));
    }
}
