//! Process-wide USB coordinator

use crate::descriptor::DeviceDescriptor;
use crate::device::UsbDevice;
use crate::error::{Result, UsbError};
use crate::inventory::{ControlPathResolver, HostDevice, discover};
use crate::locator::UsbfsLocator;
use crate::settings::TransportSettings;
use crate::usbfs::{LinuxUsbfs, UsbfsOpener};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// Selects a device during [`UsbTransport::find_device`]
pub trait DeviceChooser {
    fn choose(&mut self, descriptor: &DeviceDescriptor) -> bool;
}

impl<F> DeviceChooser for F
where
    F: FnMut(&DeviceDescriptor) -> bool,
{
    fn choose(&mut self, descriptor: &DeviceDescriptor) -> bool {
        self(descriptor)
    }
}

/// Owns the host device inventory and opens devices from it
///
/// The inventory is built on first use and kept until
/// [`forget_devices`](Self::forget_devices) is called.
pub struct UsbTransport {
    settings: TransportSettings,
    locator: UsbfsLocator,
    opener: Rc<dyn UsbfsOpener>,
    devices: Option<Vec<Arc<HostDevice>>>,
}

impl UsbTransport {
    pub fn new(settings: TransportSettings) -> Self {
        let locator = UsbfsLocator::new(&settings);
        Self::with_backend(settings, locator, Rc::new(LinuxUsbfs))
    }

    /// Use a custom locator and node opener
    pub fn with_backend(
        settings: TransportSettings,
        locator: UsbfsLocator,
        opener: Rc<dyn UsbfsOpener>,
    ) -> Self {
        Self {
            settings,
            locator,
            opener,
            devices: None,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Build the inventory if it is not cached yet
    ///
    /// A failed scan is not cached, so the next call tries again.
    pub fn initialize(&mut self) -> Result<&[Arc<HostDevice>]> {
        if self.devices.is_none() {
            let root = self.locator.locate()?;
            let resolver = ControlPathResolver::new(&self.settings.sysfs_root);
            let devices = discover(&root, &resolver)?;
            info!("USB host devices found: {} under {}", devices.len(), root.display());
            self.devices = Some(devices);
        }
        Ok(self.devices.as_deref().unwrap_or_default())
    }

    /// The cached inventory (empty before initialization)
    pub fn host_devices(&self) -> &[Arc<HostDevice>] {
        self.devices.as_deref().unwrap_or_default()
    }

    /// Drop the cached inventory
    pub fn forget_devices(&mut self) {
        if self.devices.take().is_some() {
            debug!("USB host device inventory cleared");
        }
    }

    /// Open the first host device the chooser accepts
    pub fn find_device(&mut self, chooser: &mut dyn DeviceChooser) -> Result<UsbDevice> {
        let devices = self.initialize()?.to_vec();

        for host in devices {
            if chooser.choose(&host.descriptor) {
                debug!(
                    "USB device chosen: {} {:04x}:{:04x}",
                    host.node_path.display(),
                    host.descriptor.vendor_id,
                    host.descriptor.product_id
                );
                return Ok(UsbDevice::new(
                    host,
                    Rc::clone(&self.opener),
                    self.settings.clone(),
                ));
            }
        }

        Err(UsbError::NotFound("matching USB device".to_string()))
    }
}
