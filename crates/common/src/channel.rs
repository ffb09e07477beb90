//! Async channel bridge between Tokio runtime and USB thread

use async_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use std::path::PathBuf;

/// Host device as reported to the runtime side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    /// Path of the usbfs device node
    pub node_path: PathBuf,
    /// Correlated sysfs directory, when one was found
    pub control_path: Option<PathBuf>,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// Number of configurations
    pub num_configurations: u8,
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List the host devices in the inventory
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Drop the cached inventory and walk usbfs again
    Rescan {
        /// Channel to send the new device count back
        response: tokio::sync::oneshot::Sender<Result<usize, String>>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A configured device profile was matched and opened
    DeviceOpened {
        /// Node path of the opened device
        node_path: PathBuf,
        /// USB Vendor ID
        vendor_id: u16,
        /// USB Product ID
        product_id: u16,
    },

    /// A block of input arrived on a monitored endpoint
    InputReceived {
        /// Node path of the device
        node_path: PathBuf,
        /// Endpoint address the data came from
        endpoint: u8,
        /// Filtered input bytes
        data: Vec<u8>,
    },

    /// A device stopped answering and was closed
    DeviceLost {
        /// Node path of the device
        node_path: PathBuf,
        /// Human readable reason
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public so input callbacks can hold a clone)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime without blocking the USB thread
    ///
    /// Events are dropped when the runtime side has fallen behind.
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate USB worker
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_events_reach_runtime() {
        let (bridge, worker) = create_usb_bridge();

        worker
            .send_event(UsbEvent::InputReceived {
                node_path: PathBuf::from("/dev/bus/usb/001/004"),
                endpoint: 0x81,
                data: vec![0x1b, 0x02],
            })
            .unwrap();

        match bridge.recv_event().await.unwrap() {
            UsbEvent::InputReceived { endpoint, data, .. } => {
                assert_eq!(endpoint, 0x81);
                assert_eq!(data, vec![0x1b, 0x02]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
