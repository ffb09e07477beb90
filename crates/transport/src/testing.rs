//! In-memory usbfs for tests
//!
//! [`MockUsbfs`] implements [`UsbfsOpener`]; every node it opens shares one
//! [`MockState`], which tests script and inspect through
//! [`MockUsbfs::state`]. Submitted URBs are held by address exactly as the
//! kernel would hold them and are completed by writing through the pointer,
//! so the transfer engine sees real write-back semantics.
//!
//! Do not hold the [`MockState`] borrow across a call into the device.

use crate::descriptor::{ControlDirection, SetupPacket};
use crate::usbfs::{UsbdevfsUrb, UsbfsNode, UsbfsOpener};
use nix::errno::Errno;
use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

/// Scriptable state behind every mock node
#[derive(Default)]
pub struct MockState {
    /// Node paths opened, in order
    pub opened: Vec<PathBuf>,
    /// Number of nodes closed
    pub closed: usize,
    /// Make `open` fail
    pub fail_open: bool,
    /// Every call reports `ENODEV`
    pub device_gone: bool,

    pub configuration: Option<u8>,
    pub claimed: Vec<u8>,
    /// Claim calls seen
    pub claim_attempts: usize,
    /// Errors returned by successive claims before they succeed
    pub claim_errors: VecDeque<Errno>,
    /// Driver bound to every interface (`None` = query fails)
    pub driver: Option<String>,
    pub disconnects: Vec<u8>,
    pub release_error: Option<Errno>,
    pub alternatives: Vec<(u8, u8)>,
    pub halts_cleared: Vec<u8>,

    /// Loopback store of the control endpoint
    pub control_data: Vec<u8>,
    pub control_error: Option<Errno>,

    /// Results for successive bulk reads (empty = `ETIMEDOUT`)
    pub bulk_input: VecDeque<Result<Vec<u8>, Errno>>,
    /// Bulk writes seen as (endpoint, data)
    pub bulk_output: Vec<(u8, Vec<u8>)>,
    pub bulk_output_error: Option<Errno>,

    /// URB submissions seen as (type, endpoint), including rejected ones
    pub submissions: Vec<(u8, u8)>,
    pub fail_next_submit: Option<Errno>,
    /// Reject Interrupt-typed URBs with `EINVAL`
    pub reject_interrupt_urbs: bool,
    /// Data the device answers successive URBs with as soon as they are submitted
    pub urb_responses: VecDeque<Vec<u8>>,
    pub discards: usize,

    pending: VecDeque<*mut UsbdevfsUrb>,
    completed: VecDeque<*mut UsbdevfsUrb>,
}

impl MockState {
    fn check_present(&self) -> nix::Result<()> {
        if self.device_gone {
            Err(Errno::ENODEV)
        } else {
            Ok(())
        }
    }

    /// Write a completion back into a pending URB and queue it for reaping
    fn finish(&mut self, urb: *mut UsbdevfsUrb, outcome: Result<&[u8], Errno>) {
        // URBs handed to the mock stay owned by a live device until reaped.
        unsafe {
            match outcome {
                Ok(data) => {
                    let capacity = usize::try_from((*urb).buffer_length).unwrap_or(0);
                    let count = data.len().min(capacity);
                    if count > 0 {
                        std::ptr::copy_nonoverlapping(data.as_ptr(), (*urb).buffer.cast::<u8>(), count);
                    }
                    (*urb).actual_length = count as i32;
                    (*urb).status = 0;
                }
                Err(errno) => {
                    (*urb).actual_length = 0;
                    (*urb).status = -(errno as i32);
                }
            }
        }
        self.completed.push_back(urb);
    }
}

/// Mock usbfs backend
#[derive(Clone, Default)]
pub struct MockUsbfs {
    state: Rc<RefCell<MockState>>,
}

impl MockUsbfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }

    /// URBs submitted and not yet completed
    pub fn pending_urbs(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// URBs completed and not yet reaped
    pub fn completed_urbs(&self) -> usize {
        self.state.borrow().completed.len()
    }

    /// Endpoint of the oldest pending URB
    pub fn next_pending_endpoint(&self) -> Option<u8> {
        let state = self.state.borrow();
        let urb = *state.pending.front()?;
        // Pending URBs are owned by a live device.
        Some(unsafe { (*urb).endpoint })
    }

    /// Complete the oldest pending URB with `data`
    ///
    /// Returns false if nothing was pending.
    pub fn complete_next(&self, data: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(urb) = state.pending.pop_front() else {
            return false;
        };
        state.finish(urb, Ok(data));
        true
    }

    /// Complete the most recently submitted pending URB with `data`
    pub fn complete_last(&self, data: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(urb) = state.pending.pop_back() else {
            return false;
        };
        state.finish(urb, Ok(data));
        true
    }

    /// Complete the oldest pending URB with a failure status
    pub fn complete_next_with_status(&self, errno: Errno) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(urb) = state.pending.pop_front() else {
            return false;
        };
        state.finish(urb, Err(errno));
        true
    }
}

impl UsbfsOpener for MockUsbfs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn UsbfsNode>> {
        let mut state = self.state.borrow_mut();
        if state.fail_open {
            return Err(io::Error::from_raw_os_error(Errno::ENOENT as i32));
        }
        state.opened.push(path.to_path_buf());
        Ok(Box::new(MockNode {
            state: Rc::clone(&self.state),
        }))
    }
}

struct MockNode {
    state: Rc<RefCell<MockState>>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        // Closing a node kills its URBs.
        let mut state = self.state.borrow_mut();
        state.pending.clear();
        state.completed.clear();
        state.closed += 1;
    }
}

impl UsbfsNode for MockNode {
    fn set_configuration(&self, configuration: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.configuration = Some(configuration);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.claim_attempts += 1;
        if let Some(errno) = state.claim_errors.pop_front() {
            return Err(errno);
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        if let Some(errno) = state.release_error {
            return Err(errno);
        }
        state.claimed.retain(|claimed| *claimed != interface);
        Ok(())
    }

    fn driver_name(&self, _interface: u8) -> nix::Result<String> {
        let state = self.state.borrow();
        state.check_present()?;
        state.driver.clone().ok_or(Errno::ENODATA)
    }

    fn disconnect_driver(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.disconnects.push(interface);
        state.driver = None;
        Ok(())
    }

    fn set_interface(&self, interface: u8, alternative: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.alternatives.push((interface, alternative));
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.halts_cleared.push(endpoint);
        Ok(())
    }

    fn control(&self, setup: &SetupPacket, data: &mut [u8], _timeout_ms: u32) -> nix::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        if let Some(errno) = state.control_error.take() {
            return Err(errno);
        }

        let length = data.len().min(usize::from(setup.length));
        match setup.direction() {
            ControlDirection::Output => {
                state.control_data = data[..length].to_vec();
                Ok(length)
            }
            ControlDirection::Input => {
                let count = length.min(state.control_data.len());
                data[..count].copy_from_slice(&state.control_data[..count]);
                Ok(count)
            }
        }
    }

    fn bulk(&self, endpoint: u8, data: &mut [u8], _timeout_ms: u32) -> nix::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;

        if endpoint & 0x80 == 0 {
            if let Some(errno) = state.bulk_output_error.take() {
                return Err(errno);
            }
            state.bulk_output.push((endpoint, data.to_vec()));
            return Ok(data.len());
        }

        match state.bulk_input.pop_front() {
            Some(Ok(block)) => {
                let count = block.len().min(data.len());
                data[..count].copy_from_slice(&block[..count]);
                Ok(count)
            }
            Some(Err(errno)) => Err(errno),
            None => Err(Errno::ETIMEDOUT),
        }
    }

    unsafe fn submit_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;

        let (urb_type, endpoint) = unsafe { ((*urb).urb_type, (*urb).endpoint) };
        state.submissions.push((urb_type, endpoint));

        if let Some(errno) = state.fail_next_submit.take() {
            return Err(errno);
        }
        if state.reject_interrupt_urbs && urb_type == crate::usbfs::URB_TYPE_INTERRUPT {
            return Err(Errno::EINVAL);
        }
        match state.urb_responses.pop_front() {
            Some(data) => state.finish(urb, Ok(data.as_slice())),
            None => state.pending.push_back(urb),
        }
        Ok(())
    }

    fn discard_urb(&self, urb: *mut UsbdevfsUrb) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.discards += 1;

        let Some(position) = state.pending.iter().position(|pending| *pending == urb) else {
            return Err(Errno::EINVAL);
        };
        state.pending.remove(position);
        state.finish(urb, Err(Errno::ENOENT));
        Ok(())
    }

    fn reap_urb(&self, _wait: bool) -> nix::Result<*mut UsbdevfsUrb> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.completed.pop_front().ok_or(Errno::EAGAIN)
    }

    fn wait_for_completion(&self, timeout: Duration) -> nix::Result<bool> {
        {
            let state = self.state.borrow();
            if state.device_gone || !state.completed.is_empty() {
                return Ok(true);
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(false)
    }
}
