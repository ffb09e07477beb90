//! Transport error types

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the USB transport
#[derive(Debug, Error)]
pub enum UsbError {
    /// No usbfs root could be located or mounted
    #[error("USB transport unavailable")]
    TransportUnavailable,

    /// The device node could not be opened
    #[error("USB device node unavailable: {}: {source}", path.display())]
    ResourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The interface is held by usbfs itself or could not be freed
    #[error("USB interface {interface} busy")]
    Busy { interface: u8 },

    /// The kernel rejected or failed a request
    #[error("USB {operation} failed: {errno} ({})", *errno as i32)]
    DeviceError {
        operation: &'static str,
        errno: Errno,
    },

    /// A deadline elapsed while waiting for completion
    #[error("USB transfer timed out")]
    Timeout,

    /// The requested transfer shape is not implemented
    #[error("USB operation not supported: {0}")]
    NotSupported(String),

    /// The input filter chain rejected a block
    #[error("USB input filter rejected data from endpoint {endpoint:#04x}")]
    FilterRejected { endpoint: u8 },

    /// No input was available yet; retry later
    #[error("no USB input available")]
    NoData,

    /// No matching device or request
    #[error("USB {0} not found")]
    NotFound(String),

    /// The endpoint was never defined on the device
    #[error("USB endpoint {0:#04x} not defined")]
    UndefinedEndpoint(u8),

    /// Filesystem error while scanning usbfs or sysfs
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UsbError {
    /// Build a [`UsbError::DeviceError`] for a failed kernel call
    pub fn device(operation: &'static str, errno: Errno) -> Self {
        UsbError::DeviceError { operation, errno }
    }

    /// Whether the caller should simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsbError::NoData)
    }

    /// Kernel status carried by the error, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            UsbError::DeviceError { errno, .. } => Some(*errno),
            UsbError::Busy { .. } => Some(Errno::EBUSY),
            UsbError::Timeout => Some(Errno::ETIMEDOUT),
            UsbError::NoData => Some(Errno::EAGAIN),
            UsbError::FilterRejected { .. } => Some(Errno::EIO),
            _ => None,
        }
    }
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, UsbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = UsbError::device("interface claim", Errno::EBUSY);
        let msg = err.to_string();
        assert!(msg.contains("interface claim"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_only_no_data_is_retryable() {
        assert!(UsbError::NoData.is_retryable());
        assert!(!UsbError::Timeout.is_retryable());
        assert!(!UsbError::Busy { interface: 0 }.is_retryable());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UsbError::Timeout.errno(), Some(Errno::ETIMEDOUT));
        assert_eq!(
            UsbError::device("bulk transfer", Errno::EPIPE).errno(),
            Some(Errno::EPIPE)
        );
        assert_eq!(UsbError::TransportUnavailable.errno(), None);
    }
}
