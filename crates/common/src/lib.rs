//! Common utilities for brlusb
//!
//! This crate provides shared functionality between the transport library and
//! the daemon: logging setup, payload formatting for byte-level tracing, the
//! shared error type, and the async channel bridge that connects the blocking
//! USB worker thread to the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{DeviceSummary, UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::{format_bytes, setup_logging};
