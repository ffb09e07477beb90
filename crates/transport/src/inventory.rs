//! Host device inventory
//!
//! Walks the usbfs tree and builds one [`HostDevice`] per device node. Each
//! node is correlated with its sysfs directory where possible, which is
//! where the pre-parsed descriptor and the power controls live.

use crate::descriptor::{DEVICE_DESCRIPTOR_SIZE, DescriptorOrder, DeviceDescriptor};
use crate::error::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Character-device major number of usbfs nodes
const USB_DEVICE_MAJOR: u32 = 189;

/// Device nodes per bus in the minor number space
const DEVICES_PER_BUS: u32 = 128;

/// A USB device present on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDevice {
    /// usbfs device node
    pub node_path: PathBuf,
    /// Correlated sysfs device directory
    pub control_path: Option<PathBuf>,
    pub descriptor: DeviceDescriptor,
}

/// Maps usbfs node paths onto sysfs device directories
#[derive(Debug, Clone)]
pub struct ControlPathResolver {
    root: PathBuf,
}

impl ControlPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Bus and device numbers from a `.../<bus>/<device>` node path
    pub fn bus_and_device(node_path: &Path) -> Option<(u32, u32)> {
        let mut components = node_path.iter().rev();
        let device = components.next()?.to_str()?.parse::<u32>().ok()?;
        let bus = components.next()?.to_str()?.parse::<u32>().ok()?;
        (bus > 0 && device > 0).then_some((bus, device))
    }

    /// Candidate sysfs paths for a node, in probe order
    pub fn candidates(&self, node_path: &Path) -> Vec<PathBuf> {
        let Some((bus, device)) = Self::bus_and_device(node_path) else {
            return Vec::new();
        };
        let minor = (bus - 1) * DEVICES_PER_BUS + (device - 1);

        vec![
            self.root
                .join("dev/char")
                .join(format!("{}:{}", USB_DEVICE_MAJOR, minor)),
            self.root
                .join("class/usb_device")
                .join(format!("usbdev{}.{}", bus, device))
                .join("device"),
            self.root
                .join("class/usb_endpoint")
                .join(format!("usbdev{}.{}_ep00", bus, device))
                .join("device"),
        ]
    }

    /// The first candidate that exists
    pub fn resolve(&self, node_path: &Path) -> Option<PathBuf> {
        let control = self
            .candidates(node_path)
            .into_iter()
            .find(|path| path.exists());
        match &control {
            Some(path) => trace!("control path: {} -> {}", node_path.display(), path.display()),
            None => debug!("no control path for {}", node_path.display()),
        }
        control
    }
}

/// Walk `root` and describe every device node beneath it
///
/// Devices whose descriptor cannot be read are logged and skipped. Failing
/// to read `root` itself is an error.
pub fn discover(root: &Path, resolver: &ControlPathResolver) -> Result<Vec<Arc<HostDevice>>> {
    let mut devices = Vec::new();
    let mut seen = HashSet::new();
    walk(root, resolver, &mut devices, &mut seen)?;
    debug!("host devices under {}: {}", root.display(), devices.len());
    Ok(devices)
}

fn walk(
    directory: &Path,
    resolver: &ControlPathResolver,
    devices: &mut Vec<Arc<HostDevice>>,
    seen: &mut HashSet<PathBuf>,
) -> io::Result<()> {
    let mut entries = fs::read_dir(directory)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        let is_number = name
            .to_str()
            .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
        if !is_number {
            continue;
        }

        let path = entry.path();
        let file_type = match fs::metadata(&path) {
            Ok(metadata) => metadata.file_type(),
            Err(e) => {
                warn!("USB device entry unreadable: {}: {}", path.display(), e);
                continue;
            }
        };

        if file_type.is_dir() {
            if let Err(e) = walk(&path, resolver, devices, seen) {
                warn!("USB bus directory unreadable: {}: {}", path.display(), e);
            }
        } else if file_type.is_file() || file_type.is_char_device() {
            if !seen.insert(path.clone()) {
                warn!("duplicate USB device node: {}", path.display());
                continue;
            }
            if let Some(device) = probe(path, resolver) {
                devices.push(Arc::new(device));
            }
        }
    }

    Ok(())
}

fn probe(node_path: PathBuf, resolver: &ControlPathResolver) -> Option<HostDevice> {
    let control_path = resolver.resolve(&node_path);

    let descriptor = match read_descriptor(&node_path, control_path.as_deref()) {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            warn!("USB device descriptor too short: {}", node_path.display());
            return None;
        }
        Err(e) => {
            warn!("USB device descriptor read failed: {}: {}", node_path.display(), e);
            return None;
        }
    };

    debug!(
        "USB host device: {} {:04x}:{:04x}",
        node_path.display(),
        descriptor.vendor_id,
        descriptor.product_id
    );
    Some(HostDevice {
        node_path,
        control_path,
        descriptor,
    })
}

fn read_descriptor(node_path: &Path, control_path: Option<&Path>) -> io::Result<Option<DeviceDescriptor>> {
    if let Some(control) = control_path {
        if let Ok(file) = File::open(control.join("descriptors")) {
            let raw = read_prefix(file)?;
            return Ok(DeviceDescriptor::parse(&raw, DescriptorOrder::Native));
        }
    }

    let raw = read_prefix(File::open(node_path)?)?;
    Ok(DeviceDescriptor::parse(&raw, DescriptorOrder::LittleEndian))
}

fn read_prefix(file: File) -> io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(DEVICE_DESCRIPTOR_SIZE);
    file.take(DEVICE_DESCRIPTOR_SIZE as u64).read_to_end(&mut raw)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_and_device() {
        assert_eq!(
            ControlPathResolver::bus_and_device(Path::new("/dev/bus/usb/003/012")),
            Some((3, 12))
        );
        assert_eq!(ControlPathResolver::bus_and_device(Path::new("/dev/bus/usb/003/000")), None);
        assert_eq!(ControlPathResolver::bus_and_device(Path::new("/dev/bus/usb/abc")), None);
        assert_eq!(ControlPathResolver::bus_and_device(Path::new("7")), None);
    }

    #[test]
    fn test_candidate_order_and_minor() {
        let resolver = ControlPathResolver::new("/sys");
        let candidates = resolver.candidates(Path::new("/dev/bus/usb/002/005"));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/sys/dev/char/189:132"),
                PathBuf::from("/sys/class/usb_device/usbdev2.5/device"),
                PathBuf::from("/sys/class/usb_endpoint/usbdev2.5_ep00/device"),
            ]
        );
    }

    #[test]
    fn test_unparseable_node_has_no_candidates() {
        let resolver = ControlPathResolver::new("/sys");
        assert!(resolver.candidates(Path::new("/dev/null")).is_empty());
    }
}
