//! USB worker thread
//!
//! Dedicated thread that owns the transport and every opened display.
//! usbfs handles never leave this thread; the Tokio side talks to it through
//! the channel bridge from `common`.

use crate::config::{DeviceFilter, DeviceProfile};
use anyhow::{Context, Result};
use async_channel::Sender;
use common::{DeviceSummary, UsbCommand, UsbEvent, UsbWorker};
use nix::errno::Errno;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use transport::{
    DeviceDescriptor, HostDevice, InputNotice, TransportSettings, UsbDevice, UsbError, UsbTransport,
};

/// Time spent pumping device events between command checks
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct OpenDevice {
    /// Index into the profile list
    profile: usize,
    device: UsbDevice,
    /// Input endpoint number whose monitor is running
    monitored: Option<u8>,
}

pub struct UsbWorkerThread {
    transport: UsbTransport,
    profiles: Vec<DeviceProfile>,
    open: Vec<OpenDevice>,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, settings: TransportSettings, profiles: Vec<DeviceProfile>) -> Self {
        Self::with_transport(worker, UsbTransport::new(settings), profiles)
    }

    pub fn with_transport(
        worker: UsbWorker,
        transport: UsbTransport,
        profiles: Vec<DeviceProfile>,
    ) -> Self {
        Self {
            transport,
            profiles,
            open: Vec::new(),
            worker,
        }
    }

    /// Run until a Shutdown command arrives
    ///
    /// Each iteration:
    /// 1. Checks for a command from Tokio (non-blocking)
    /// 2. Pumps completions and monitor timers of every open device
    pub fn run(mut self) -> Result<()> {
        info!("USB worker thread started");
        self.open_profiles();

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            self.pump(POLL_INTERVAL);
        }

        // Dropping the handles cancels monitors and closes the nodes.
        self.open.clear();
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Open every profile that has no device yet
    fn open_profiles(&mut self) {
        for index in 0..self.profiles.len() {
            if self.open.iter().any(|open| open.profile == index) {
                continue;
            }
            let profile = self.profiles[index].clone();

            match self.open_profile(&profile) {
                Ok((device, monitored)) => {
                    let host = device.host();
                    info!(
                        "Opened {} at {}",
                        profile.label(),
                        host.node_path.display()
                    );
                    self.send_event(UsbEvent::DeviceOpened {
                        node_path: host.node_path.clone(),
                        vendor_id: host.descriptor.vendor_id,
                        product_id: host.descriptor.product_id,
                    });
                    self.open.push(OpenDevice {
                        profile: index,
                        device,
                        monitored,
                    });
                }
                Err(e) => warn!("Device profile {} not opened: {:#}", profile.label(), e),
            }
        }
    }

    /// Open and set up the device for `profile`, with its monitored input endpoint
    fn open_profile(&mut self, profile: &DeviceProfile) -> Result<(UsbDevice, Option<u8>)> {
        let filter = DeviceFilter::parse(&profile.filter)?;
        let mut chooser = |descriptor: &DeviceDescriptor| filter.matches(descriptor);
        let mut device = self
            .transport
            .find_device(&mut chooser)
            .with_context(|| format!("No device matches {}", profile.filter))?;

        device
            .set_configuration(profile.configuration)
            .context("Failed to set configuration")?;
        device
            .claim_interface(profile.interface)
            .with_context(|| format!("Failed to claim interface {}", profile.interface))?;
        if let Some(alternative) = profile.alternative {
            device
                .set_alternative_setting(profile.interface, alternative)
                .with_context(|| format!("Failed to select alternative setting {}", alternative))?;
        }

        if let Some(output) = &profile.output_endpoint {
            device.define_endpoint(output.output_descriptor());
        }
        if profile.disable_autosuspend && !device.disable_autosuspend() {
            debug!("Autosuspend left enabled for {}", profile.label());
        }

        let mut monitored = None;
        if let Some(input) = &profile.input_endpoint {
            device.define_endpoint(input.input_descriptor());
            let events = self.worker.event_tx.clone();
            let node_path = device.host().node_path.clone();
            let monitored_input = device.monitor_input_endpoint(input.number, move |notice: &InputNotice<'_>| {
                forward_input(&events, &node_path, notice)
            });
            match monitored_input {
                Ok(()) => monitored = Some(input.number),
                Err(e) => warn!(
                    "Input endpoint {} of {} is not monitored: {}",
                    input.number,
                    profile.label(),
                    e
                ),
            }
        }

        Ok((device, monitored))
    }

    /// Pump every open device once, splitting `timeout` between them
    fn pump(&mut self, timeout: Duration) {
        if self.open.is_empty() {
            thread::sleep(timeout);
            return;
        }

        let slice = timeout / u32::try_from(self.open.len()).unwrap_or(u32::MAX);
        let mut lost = Vec::new();
        for (index, open) in self.open.iter_mut().enumerate() {
            match open.device.handle_events(slice) {
                // A monitor only stops on a fault, which on unplug comes
                // before usbfs reports ENODEV.
                Ok(()) => {
                    if let Some(number) = open.monitored {
                        if !open.device.is_monitoring(number) {
                            lost.push((index, monitor_fault(&mut open.device, number)));
                        }
                    }
                }
                Err(e) if is_device_gone(&e) => lost.push((index, e.to_string())),
                Err(e) => {
                    warn!(
                        "Error handling USB events for {}: {}",
                        open.device.host().node_path.display(),
                        e
                    );
                }
            }
        }

        for (index, reason) in lost.into_iter().rev() {
            let open = self.open.remove(index);
            let node_path = open.device.host().node_path.clone();
            warn!("USB device lost: {}: {}", node_path.display(), reason);
            drop(open);
            self.send_event(UsbEvent::DeviceLost { node_path, reason });
        }
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::Rescan { response } => {
                self.transport.forget_devices();
                let result = self
                    .transport
                    .initialize()
                    .map(|devices| devices.len())
                    .map_err(|e| e.to_string());
                if result.is_ok() {
                    self.open_profiles();
                }
                let _ = response.send(result);
            }

            UsbCommand::Shutdown => debug!("Shutdown is handled by the worker loop"),
        }
    }

    fn list_devices(&mut self) -> Vec<DeviceSummary> {
        match self.transport.initialize() {
            Ok(devices) => devices.iter().map(|host| summarize(host)).collect(),
            Err(e) => {
                warn!("USB inventory unavailable: {}", e);
                Vec::new()
            }
        }
    }

    fn send_event(&self, event: UsbEvent) {
        if let Err(e) = self.worker.send_event(event) {
            debug!("USB event not delivered: {}", e);
        }
    }
}

fn summarize(host: &HostDevice) -> DeviceSummary {
    DeviceSummary {
        node_path: host.node_path.clone(),
        control_path: host.control_path.clone(),
        vendor_id: host.descriptor.vendor_id,
        product_id: host.descriptor.product_id,
        class: host.descriptor.device_class,
        num_configurations: host.descriptor.num_configurations,
    }
}

fn is_device_gone(error: &UsbError) -> bool {
    error.errno() == Some(Errno::ENODEV)
}

/// Reason a monitored input endpoint stopped
fn monitor_fault(device: &mut UsbDevice, number: u8) -> String {
    let mut buffer = [0u8; 64];
    match device.read_endpoint(number, &mut buffer, Duration::ZERO) {
        Err(e) if !e.is_retryable() => format!("input monitor stopped: {}", e),
        _ => "input monitor stopped".to_string(),
    }
}

/// Input callback body; false once the runtime side has gone away
fn forward_input(events: &Sender<UsbEvent>, node_path: &Path, notice: &InputNotice<'_>) -> bool {
    let event = UsbEvent::InputReceived {
        node_path: node_path.to_path_buf(),
        endpoint: notice.endpoint,
        data: notice.data.to_vec(),
    };
    match events.try_send(event) {
        Ok(()) => true,
        Err(e) if e.is_full() => {
            warn!("Input event dropped, runtime is behind: {:#04x}", notice.endpoint);
            true
        }
        Err(_) => {
            debug!("Event channel closed, input callback unregistered");
            false
        }
    }
}

/// Spawn the USB worker thread
///
/// The transport is created on the new thread and never leaves it.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    settings: TransportSettings,
    profiles: Vec<DeviceProfile>,
) -> std::io::Result<thread::JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(worker, settings, profiles).run())
}
