//! Transport tuning knobs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings that shape how the transport talks to usbfs
///
/// Every field has a default so a partial `[usb]` table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Keep a request permanently in flight on input endpoints
    pub input_monitor: bool,
    /// Read interrupt endpoints through the bulk ioctl instead of polling URBs
    pub treat_interrupt_as_bulk: bool,
    /// Resubmission interval (ms) for endpoints reporting a zero bInterval
    pub resubmit_delay_ms: u32,
    /// Upper bound (ms) on the input backoff interval
    pub max_backoff_ms: u32,
    /// Number of completion channels available to input monitors
    pub completion_slots: usize,
    /// Root of the sysfs tree used for control-path correlation
    pub sysfs_root: PathBuf,
    /// Writable directory for a private usbfs mount of last resort
    pub private_mount_dir: Option<PathBuf>,
}

impl TransportSettings {
    fn default_private_mount_dir() -> PathBuf {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            runtime_dir.join("brlusb").join("usbfs")
        } else {
            PathBuf::from("/run/brlusb/usbfs")
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            input_monitor: true,
            treat_interrupt_as_bulk: true,
            resubmit_delay_ms: 8,
            max_backoff_ms: 40,
            completion_slots: 32,
            sysfs_root: PathBuf::from("/sys"),
            private_mount_dir: Some(Self::default_private_mount_dir()),
        }
    }
}
