//! Opened USB device handle
//!
//! A [`UsbDevice`] wraps one host device. The usbfs node is opened on the
//! first operation that needs it and closed when the handle is dropped.
//! Transfers live in [`crate::transfer`] and monitoring in
//! [`crate::monitor`]; both extend this type.

use crate::completion::CompletionHub;
use crate::descriptor::{
    ControlDirection, ControlRecipient, ControlType, DeviceDescriptor, EndpointDescriptor,
    SetupPacket,
};
use crate::endpoint::EndpointState;
use crate::error::{Result, UsbError};
use crate::filter::{InputFilter, InputFilters};
use crate::inventory::HostDevice;
use crate::request::TransferRequest;
use crate::settings::TransportSettings;
use crate::usbfs::{USBFS_DRIVER_NAME, UsbfsNode, UsbfsOpener};
use common::format_bytes;
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Values tried in order when disabling autosuspend
const AUTOSUSPEND_DISABLE_VALUES: &[&str] = &["-1", "0"];

/// Lazily opened usbfs node
pub(crate) struct NodeSlot {
    path: PathBuf,
    opener: Rc<dyn UsbfsOpener>,
    file: Option<Box<dyn UsbfsNode>>,
}

impl NodeSlot {
    fn new(path: PathBuf, opener: Rc<dyn UsbfsOpener>) -> Self {
        Self {
            path,
            opener,
            file: None,
        }
    }

    /// The open node, opening it first if needed
    pub fn get(&mut self) -> Result<&dyn UsbfsNode> {
        let node = match self.file.take() {
            Some(node) => node,
            None => {
                let node = self.opener.open(&self.path).map_err(|source| {
                    error!("USB device open failed: {}: {}", self.path.display(), source);
                    UsbError::ResourceUnavailable {
                        path: self.path.clone(),
                        source,
                    }
                })?;
                debug!("USB device opened: {}", self.path.display());
                node
            }
        };
        Ok(&**self.file.insert(node))
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("USB device closed: {}", self.path.display());
        }
    }
}

/// Steps of an interface claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimStep {
    TryClaim,
    Disconnect,
    RetryClaim,
    Fail,
}

/// An opened USB device
pub struct UsbDevice {
    pub(crate) host: Arc<HostDevice>,
    pub(crate) settings: TransportSettings,
    pub(crate) node: NodeSlot,
    pub(crate) endpoints: BTreeMap<u8, EndpointState>,
    /// Submitted requests keyed by URB address
    pub(crate) in_flight: HashMap<usize, Box<TransferRequest>>,
    pub(crate) filters: InputFilters,
    pub(crate) hub: CompletionHub,
    next_request: u64,
}

impl UsbDevice {
    pub(crate) fn new(
        host: Arc<HostDevice>,
        opener: Rc<dyn UsbfsOpener>,
        settings: TransportSettings,
    ) -> Self {
        let hub = CompletionHub::new(settings.completion_slots);
        Self {
            node: NodeSlot::new(host.node_path.clone(), opener),
            host,
            settings,
            endpoints: BTreeMap::new(),
            in_flight: HashMap::new(),
            filters: InputFilters::new(),
            hub,
            next_request: 1,
        }
    }

    /// The host device this handle was opened on
    pub fn host(&self) -> &Arc<HostDevice> {
        &self.host
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.host.descriptor
    }

    /// Whether the usbfs node is currently open
    pub fn is_open(&self) -> bool {
        self.node.is_open()
    }

    /// Declare an endpoint of the active configuration
    ///
    /// Redefining an endpoint replaces its descriptor and keeps its queues.
    pub fn define_endpoint(&mut self, descriptor: EndpointDescriptor) {
        debug!(
            "USB endpoint defined: {:#04x} {:?} size={} interval={}",
            descriptor.address,
            descriptor.transfer(),
            descriptor.max_packet_size,
            descriptor.interval
        );
        self.endpoints
            .entry(descriptor.address)
            .and_modify(|state| state.descriptor = descriptor)
            .or_insert_with(|| EndpointState::new(descriptor));
    }

    /// Append a stage to the input filter chain
    pub fn add_input_filter<F: InputFilter + 'static>(&mut self, filter: F) {
        self.filters.push(filter);
    }

    pub(crate) fn next_request_id(&mut self) -> crate::request::RequestId {
        let id = crate::request::RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    pub(crate) fn endpoint(&self, address: u8) -> Result<&EndpointState> {
        self.endpoints
            .get(&address)
            .ok_or(UsbError::UndefinedEndpoint(address))
    }

    pub fn set_configuration(&mut self, configuration: u8) -> Result<()> {
        let node = self.node.get()?;
        node.set_configuration(configuration).map_err(|errno| {
            error!("USB configuration set failed: {} ({})", errno, errno as i32);
            UsbError::device("configuration set", errno)
        })?;
        debug!("USB configuration set: {}", configuration);
        Ok(())
    }

    /// Claim an interface, evicting a foreign kernel driver once if needed
    pub fn claim_interface(&mut self, interface: u8) -> Result<()> {
        let node = self.node.get()?;
        let mut step = ClaimStep::TryClaim;

        loop {
            step = match step {
                ClaimStep::TryClaim | ClaimStep::RetryClaim => match node.claim_interface(interface) {
                    Ok(()) => {
                        info!("USB interface claimed: {}", interface);
                        return Ok(());
                    }
                    Err(Errno::EBUSY) if step == ClaimStep::TryClaim => ClaimStep::Disconnect,
                    Err(Errno::EBUSY) => {
                        warn!("USB interface still busy after driver disconnect: {}", interface);
                        ClaimStep::Fail
                    }
                    Err(errno) => {
                        error!("USB interface claim failed: {}: {} ({})", interface, errno, errno as i32);
                        return Err(UsbError::device("interface claim", errno));
                    }
                },
                ClaimStep::Disconnect => match node.driver_name(interface) {
                    Ok(driver) if driver == USBFS_DRIVER_NAME => {
                        warn!("USB interface already claimed through usbfs: {}", interface);
                        ClaimStep::Fail
                    }
                    Ok(driver) => {
                        info!("USB interface {} held by driver {}; disconnecting", interface, driver);
                        match node.disconnect_driver(interface) {
                            Ok(()) => ClaimStep::RetryClaim,
                            Err(errno) => {
                                error!("USB driver disconnect failed: {} ({})", errno, errno as i32);
                                ClaimStep::Fail
                            }
                        }
                    }
                    Err(errno) => {
                        error!("USB driver query failed: {} ({})", errno, errno as i32);
                        ClaimStep::Fail
                    }
                },
                ClaimStep::Fail => return Err(UsbError::Busy { interface }),
            };
        }
    }

    /// Release an interface; a vanished device counts as released
    pub fn release_interface(&mut self, interface: u8) -> Result<()> {
        let node = self.node.get()?;
        match node.release_interface(interface) {
            Ok(()) => {
                debug!("USB interface released: {}", interface);
                Ok(())
            }
            Err(Errno::ENODEV) => {
                debug!("USB interface released with device gone: {}", interface);
                Ok(())
            }
            Err(errno) => {
                error!("USB interface release failed: {}: {} ({})", interface, errno, errno as i32);
                Err(UsbError::device("interface release", errno))
            }
        }
    }

    pub fn set_alternative_setting(&mut self, interface: u8, alternative: u8) -> Result<()> {
        let node = self.node.get()?;
        node.set_interface(interface, alternative).map_err(|errno| {
            error!("USB alternative setting failed: {} ({})", errno, errno as i32);
            UsbError::device("alternative setting", errno)
        })?;
        debug!("USB alternative setting: interface={} alternative={}", interface, alternative);
        Ok(())
    }

    /// Clear a halt condition on an endpoint address
    pub fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        let node = self.node.get()?;
        node.clear_halt(endpoint).map_err(|errno| {
            error!("USB endpoint clear failed: {:#04x}: {} ({})", endpoint, errno, errno as i32);
            UsbError::device("halt clear", errno)
        })
    }

    /// Name of the kernel driver bound to an interface
    pub fn driver_name(&mut self, interface: u8) -> Result<String> {
        let node = self.node.get()?;
        node.driver_name(interface).map_err(|errno| {
            debug!("USB driver query failed: {} ({})", errno, errno as i32);
            UsbError::device("driver query", errno)
        })
    }

    /// Issue a control transfer, returning the data-stage byte count
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &mut self,
        direction: ControlDirection,
        recipient: ControlRecipient,
        kind: ControlType,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let length = u16::try_from(buffer.len())
            .map_err(|_| UsbError::NotSupported(format!("control transfer of {} bytes", buffer.len())))?;
        let setup = SetupPacket::new(direction, recipient, kind, request, value, index, length);
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        trace!(
            "control: type={:02x} request={:02x} value={:04x} index={:04x} length={}",
            setup.request_type, request, value, index, length
        );
        if direction == ControlDirection::Output {
            trace!("control output: {}", format_bytes(buffer));
        }

        let node = self.node.get()?;
        match node.control(&setup, buffer, timeout_ms) {
            Ok(count) => {
                if direction == ControlDirection::Input {
                    trace!("control input: {}", format_bytes(&buffer[..count.min(buffer.len())]));
                }
                Ok(count)
            }
            Err(errno) => {
                error!("USB control transfer failed: {} ({})", errno, errno as i32);
                Err(UsbError::device("control transfer", errno))
            }
        }
    }

    /// Turn off runtime power management for the device
    ///
    /// Best effort: returns whether a value was accepted.
    pub fn disable_autosuspend(&self) -> bool {
        let Some(control) = &self.host.control_path else {
            debug!("no control path for autosuspend: {}", self.host.node_path.display());
            return false;
        };
        let path = control.join("power").join("autosuspend");

        for value in AUTOSUSPEND_DISABLE_VALUES {
            let written = OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|mut file| file.write_all(value.as_bytes()));
            match written {
                Ok(()) => {
                    debug!("USB autosuspend disabled: {} = {}", path.display(), value);
                    return true;
                }
                Err(e) if e.raw_os_error() == Some(Errno::EINVAL as i32) => {
                    trace!("autosuspend value rejected: {}", value);
                }
                Err(e) => {
                    warn!("USB autosuspend disable failed: {}: {}", path.display(), e);
                    return false;
                }
            }
        }
        false
    }

    fn teardown(&mut self) {
        let addresses: Vec<u8> = self.endpoints.keys().copied().collect();
        for address in addresses {
            self.stop_monitor(address);
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.teardown();
        // Closing the node makes the kernel kill anything still submitted.
        self.node.close();
        if !self.in_flight.is_empty() {
            debug!("freeing {} outstanding USB requests", self.in_flight.len());
        }
        self.in_flight.clear();
        self.endpoints.clear();
    }
}
