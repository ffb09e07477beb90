//! Asynchronous USB transport over Linux usbfs
//!
//! This crate talks to USB devices through the kernel's usbfs device nodes
//! without a userspace USB library. It provides:
//!
//! - discovery of the usbfs root and of the host devices beneath it
//! - device handles with configuration, interface and control operations
//! - synchronous bulk and interrupt reads and writes
//! - raw asynchronous requests (URBs) with submit, reap and cancel
//! - a per-endpoint input monitor that keeps a request in flight and
//!   buffers or forwards whatever arrives
//!
//! Everything runs on the caller's thread. Asynchronous completions are
//! collected whenever the caller pumps [`UsbDevice::handle_events`] or a
//! synchronous operation waits.

pub mod completion;
pub mod descriptor;
mod device;
mod endpoint;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod locator;
mod monitor;
pub mod request;
pub mod settings;
pub mod testing;
mod transfer;
mod transport;
pub mod usbfs;

pub use descriptor::{
    ControlDirection, ControlRecipient, ControlType, DeviceDescriptor, EndpointDescriptor,
    EndpointDirection, EndpointTransfer,
};
pub use device::UsbDevice;
pub use error::{Result, UsbError};
pub use filter::{InputFilter, InputFilters};
pub use inventory::{ControlPathResolver, HostDevice};
pub use locator::UsbfsLocator;
pub use monitor::{InputCallback, InputNotice, next_backoff, nominal_interval};
pub use request::{RequestId, TransferKind, TransferRequest, UsbResponse};
pub use settings::TransportSettings;
pub use transport::{DeviceChooser, UsbTransport};
