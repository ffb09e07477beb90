//! usbfs kernel interface
//!
//! The `#[repr(C)]` structures below mirror `linux/usbdevice_fs.h`. The
//! [`UsbfsOpener`] and [`UsbfsNode`] traits are the seam between the
//! transfer engine and the kernel; [`LinuxUsbfs`] is the real implementation
//! and [`crate::testing::MockUsbfs`] stands in for it in tests.

use crate::descriptor::SetupPacket;
use nix::errno::Errno;
use nix::libc::{c_int, c_uint, c_void};
use nix::poll::{PollFd, PollFlags, poll};
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr, ioctl_write_ptr_bad, request_code_none};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::ptr;
use std::time::Duration;
use tracing::debug;

pub const URB_TYPE_ISO: u8 = 0;
pub const URB_TYPE_INTERRUPT: u8 = 1;
pub const URB_TYPE_CONTROL: u8 = 2;
pub const URB_TYPE_BULK: u8 = 3;

pub const URB_SHORT_NOT_OK: u32 = 0x01;
pub const URB_ISO_ASAP: u32 = 0x02;
pub const URB_BULK_CONTINUATION: u32 = 0x04;
pub const URB_NO_FSBR: u32 = 0x20;
pub const URB_ZERO_PACKET: u32 = 0x40;
pub const URB_NO_INTERRUPT: u32 = 0x80;

/// Name the kernel reports for interfaces claimed through usbfs
pub const USBFS_DRIVER_NAME: &str = "usbfs";

const MAX_DRIVER_NAME: usize = 255;

#[repr(C)]
struct UsbdevfsCtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut c_void,
}

#[repr(C)]
struct UsbdevfsBulkTransfer {
    ep: c_uint,
    len: c_uint,
    timeout: c_uint,
    data: *mut c_void,
}

#[repr(C)]
struct UsbdevfsSetInterface {
    interface: c_uint,
    altsetting: c_uint,
}

#[repr(C)]
struct UsbdevfsGetDriver {
    interface: c_uint,
    driver: [u8; MAX_DRIVER_NAME + 1],
}

#[repr(C)]
struct UsbdevfsIoctl {
    ifno: c_int,
    ioctl_code: c_int,
    data: *mut c_void,
}

/// Kernel URB header (`struct usbdevfs_urb` without iso frame descriptors)
#[repr(C)]
#[derive(Debug)]
pub struct UsbdevfsUrb {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets: c_int,
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

impl Default for UsbdevfsUrb {
    fn default() -> Self {
        Self {
            urb_type: URB_TYPE_BULK,
            endpoint: 0,
            status: 0,
            flags: 0,
            buffer: ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        }
    }
}

ioctl_readwrite!(usbdevfs_control, b'U', 0, UsbdevfsCtrlTransfer);
ioctl_readwrite!(usbdevfs_bulk, b'U', 2, UsbdevfsBulkTransfer);
ioctl_read!(usbdevfs_setinterface, b'U', 4, UsbdevfsSetInterface);
ioctl_read!(usbdevfs_setconfiguration, b'U', 5, c_uint);
ioctl_write_ptr!(usbdevfs_getdriver, b'U', 8, UsbdevfsGetDriver);
ioctl_read!(usbdevfs_submiturb, b'U', 10, UsbdevfsUrb);
ioctl_write_ptr_bad!(usbdevfs_discardurb, request_code_none!(b'U', 11), UsbdevfsUrb);
ioctl_write_ptr!(usbdevfs_reapurb, b'U', 12, *mut UsbdevfsUrb);
ioctl_write_ptr!(usbdevfs_reapurbndelay, b'U', 13, *mut UsbdevfsUrb);
ioctl_read!(usbdevfs_claiminterface, b'U', 15, c_uint);
ioctl_read!(usbdevfs_releaseinterface, b'U', 16, c_uint);
ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, UsbdevfsIoctl);
ioctl_read!(usbdevfs_clear_halt, b'U', 21, c_uint);

const USBDEVFS_DISCONNECT: c_int = request_code_none!(b'U', 22) as c_int;

/// Opens usbfs device nodes
pub trait UsbfsOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn UsbfsNode>>;
}

/// An open usbfs device node
///
/// Methods map one-to-one onto usbfs ioctls and report the raw errno.
pub trait UsbfsNode {
    fn set_configuration(&self, configuration: u8) -> nix::Result<()>;
    fn claim_interface(&self, interface: u8) -> nix::Result<()>;
    fn release_interface(&self, interface: u8) -> nix::Result<()>;
    /// Name of the kernel driver bound to `interface`
    fn driver_name(&self, interface: u8) -> nix::Result<String>;
    fn disconnect_driver(&self, interface: u8) -> nix::Result<()>;
    fn set_interface(&self, interface: u8, alternative: u8) -> nix::Result<()>;
    fn clear_halt(&self, endpoint: u8) -> nix::Result<()>;
    /// Issue a control transfer, returning the data-stage byte count
    fn control(&self, setup: &SetupPacket, data: &mut [u8], timeout_ms: u32) -> nix::Result<usize>;
    /// Issue a blocking bulk (or bulk-emulated interrupt) transfer
    fn bulk(&self, endpoint: u8, data: &mut [u8], timeout_ms: u32) -> nix::Result<usize>;

    /// Hand a URB to the kernel
    ///
    /// # Safety
    ///
    /// `urb` and the buffer it points at must stay valid and must not move
    /// until the URB has been reaped or the node has been closed.
    unsafe fn submit_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()>;
    /// Ask the kernel to cancel a submitted URB
    fn discard_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()>;
    /// Take one completed URB back from the kernel
    ///
    /// A non-blocking reap with nothing completed fails with `EAGAIN`.
    fn reap_urb(&self, wait: bool) -> nix::Result<*mut UsbdevfsUrb>;
    /// Wait until a completed URB can be reaped or `timeout` elapses
    fn wait_for_completion(&self, timeout: Duration) -> nix::Result<bool>;
}

/// Opener for real usbfs nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxUsbfs;

impl UsbfsOpener for LinuxUsbfs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn UsbfsNode>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("usbfs file opened: {} fd={}", path.display(), file.as_raw_fd());
        Ok(Box::new(LinuxNode { file }))
    }
}

struct LinuxNode {
    file: File,
}

impl LinuxNode {
    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }
}

impl UsbfsNode for LinuxNode {
    fn set_configuration(&self, configuration: u8) -> nix::Result<()> {
        let mut arg = c_uint::from(configuration);
        unsafe { usbdevfs_setconfiguration(self.fd(), &mut arg) }.map(drop)
    }

    fn claim_interface(&self, interface: u8) -> nix::Result<()> {
        let mut arg = c_uint::from(interface);
        unsafe { usbdevfs_claiminterface(self.fd(), &mut arg) }.map(drop)
    }

    fn release_interface(&self, interface: u8) -> nix::Result<()> {
        let mut arg = c_uint::from(interface);
        unsafe { usbdevfs_releaseinterface(self.fd(), &mut arg) }.map(drop)
    }

    fn driver_name(&self, interface: u8) -> nix::Result<String> {
        let mut arg = UsbdevfsGetDriver {
            interface: c_uint::from(interface),
            driver: [0; MAX_DRIVER_NAME + 1],
        };
        unsafe { usbdevfs_getdriver(self.fd(), &mut arg as *mut UsbdevfsGetDriver) }?;

        let end = arg.driver.iter().position(|&b| b == 0).unwrap_or(MAX_DRIVER_NAME);
        Ok(String::from_utf8_lossy(&arg.driver[..end]).into_owned())
    }

    fn disconnect_driver(&self, interface: u8) -> nix::Result<()> {
        let mut arg = UsbdevfsIoctl {
            ifno: c_int::from(interface),
            ioctl_code: USBDEVFS_DISCONNECT,
            data: ptr::null_mut(),
        };
        unsafe { usbdevfs_ioctl(self.fd(), &mut arg) }.map(drop)
    }

    fn set_interface(&self, interface: u8, alternative: u8) -> nix::Result<()> {
        let mut arg = UsbdevfsSetInterface {
            interface: c_uint::from(interface),
            altsetting: c_uint::from(alternative),
        };
        unsafe { usbdevfs_setinterface(self.fd(), &mut arg) }.map(drop)
    }

    fn clear_halt(&self, endpoint: u8) -> nix::Result<()> {
        let mut arg = c_uint::from(endpoint);
        unsafe { usbdevfs_clear_halt(self.fd(), &mut arg) }.map(drop)
    }

    fn control(&self, setup: &SetupPacket, data: &mut [u8], timeout_ms: u32) -> nix::Result<usize> {
        let length = u16::try_from(data.len()).map_err(|_| Errno::EINVAL)?;
        let mut arg = UsbdevfsCtrlTransfer {
            request_type: setup.request_type,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length: length.min(setup.length),
            timeout: timeout_ms,
            data: data.as_mut_ptr().cast(),
        };
        let count = unsafe { usbdevfs_control(self.fd(), &mut arg) }?;
        Ok(count as usize)
    }

    fn bulk(&self, endpoint: u8, data: &mut [u8], timeout_ms: u32) -> nix::Result<usize> {
        let mut arg = UsbdevfsBulkTransfer {
            ep: c_uint::from(endpoint),
            len: c_uint::try_from(data.len()).map_err(|_| Errno::EINVAL)?,
            timeout: timeout_ms,
            data: data.as_mut_ptr().cast(),
        };
        let count = unsafe { usbdevfs_bulk(self.fd(), &mut arg) }?;
        Ok(count as usize)
    }

    unsafe fn submit_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()> {
        unsafe { usbdevfs_submiturb(self.fd(), urb) }.map(drop)
    }

    fn discard_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()> {
        // The kernel only uses the address to find its own record.
        unsafe { usbdevfs_discardurb(self.fd(), urb) }.map(drop)
    }

    fn reap_urb(&self, wait: bool) -> nix::Result<*mut UsbdevfsUrb> {
        let mut urb: *mut UsbdevfsUrb = ptr::null_mut();
        let slot = &mut urb as *mut *mut UsbdevfsUrb;
        if wait {
            unsafe { usbdevfs_reapurb(self.fd(), slot) }?;
        } else {
            unsafe { usbdevfs_reapurbndelay(self.fd(), slot) }?;
        }

        if urb.is_null() {
            return Err(Errno::EAGAIN);
        }
        Ok(urb)
    }

    fn wait_for_completion(&self, timeout: Duration) -> nix::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
        let ready = poll(&mut fds, millis)?;
        Ok(ready > 0)
    }
}
