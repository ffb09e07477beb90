//! Transfer engine
//!
//! Requests (URBs) are submitted asynchronously and reaped back onto their
//! endpoint's completed queue. The synchronous helpers used by drivers are
//! built on top:
//!
//! - bulk and bulk-emulated interrupt transfers go through the blocking
//!   bulk ioctl
//! - polled interrupt transfers submit one URB and pump events until it
//!   completes or the deadline passes
//! - monitored input endpoints are served from their input buffer
//!
//! [`UsbDevice::handle_events`] is the single point where completions are
//! collected, so callers that only use monitors must pump it regularly.

use crate::descriptor::{EndpointDirection, EndpointTransfer};
use crate::device::UsbDevice;
use crate::error::{Result, UsbError};
use crate::request::{RequestId, TransferKind, TransferRequest, UsbResponse};
use common::format_bytes;
use nix::errno::Errno;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Endpoint address of input endpoint `number`
pub(crate) fn input_address(number: u8) -> u8 {
    (number & 0x0f) | 0x80
}

/// Endpoint address of output endpoint `number`
pub(crate) fn output_address(number: u8) -> u8 {
    number & 0x0f
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Deadline `timeout` from now; `None` when it is beyond what `Instant` holds
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`; unbounded without one
pub(crate) fn time_left(deadline: Option<Instant>, now: Instant) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(now))
}

impl UsbDevice {
    /// Build a request for a defined endpoint address
    ///
    /// `data` is copied in for output endpoints only.
    pub fn allocate_request(
        &mut self,
        endpoint: u8,
        data: Option<&[u8]>,
        length: usize,
        context: u64,
    ) -> Result<Box<TransferRequest>> {
        let descriptor = self.endpoint(endpoint)?.descriptor;
        let id = self.next_request_id();
        TransferRequest::allocate(id, &descriptor, data, length, context)
    }

    /// Hand a request to the kernel
    ///
    /// An Interrupt request the kernel rejects with `EINVAL` on a nominal
    /// Interrupt endpoint is retried once as Bulk; the endpoint then keeps
    /// submitting as Bulk.
    pub fn submit_request(&mut self, mut request: Box<TransferRequest>) -> Result<RequestId> {
        let address = request.endpoint();
        let node = self.node.get()?;
        let state = self
            .endpoints
            .get_mut(&address)
            .ok_or(UsbError::UndefinedEndpoint(address))?;

        if state.interrupt_as_bulk && request.kind() == TransferKind::Interrupt {
            request.retype(TransferKind::Bulk);
        }
        if state.descriptor.direction() == EndpointDirection::Output {
            trace!("URB output: {}", format_bytes(request.buffer()));
        }

        // The request is boxed, so the URB address stays valid after the
        // box moves into the in-flight table.
        let mut submitted = unsafe { node.submit_urb(request.urb_ptr()) };
        if submitted == Err(Errno::EINVAL)
            && request.kind() == TransferKind::Interrupt
            && state.descriptor.transfer() == EndpointTransfer::Interrupt
        {
            warn!("USB interrupt URB rejected, retrying as bulk: {:#04x}", address);
            request.retype(TransferKind::Bulk);
            submitted = unsafe { node.submit_urb(request.urb_ptr()) };
            if submitted.is_ok() {
                state.interrupt_as_bulk = true;
            }
        }

        if let Err(errno) = submitted {
            error!("USB URB submit failed: {:?}: {} ({})", request, errno, errno as i32);
            return Err(UsbError::device("URB submit", errno));
        }

        trace!("URB submitted: {:?}", request);
        let id = request.id();
        self.in_flight.insert(request.urb_addr(), request);
        Ok(id)
    }

    /// Take one completed request back from the kernel
    ///
    /// The request is filed on its endpoint's completed queue and the
    /// endpoint's monitor, if any, is notified. `Ok(None)` means nothing
    /// had completed.
    pub(crate) fn reap(&mut self, wait: bool) -> Result<Option<RequestId>> {
        let node = self.node.get()?;
        let urb = match node.reap_urb(wait) {
            Ok(urb) => urb,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(errno) => {
                if errno != Errno::ENODEV {
                    error!("USB URB reap failed: {} ({})", errno, errno as i32);
                }
                return Err(UsbError::device("URB reap", errno));
            }
        };

        let Some(request) = self.in_flight.remove(&(urb as usize)) else {
            warn!("USB URB reaped but not in flight: {:p}", urb);
            return Err(UsbError::NotFound(format!("request at {:p}", urb)));
        };
        trace!("URB reaped: {:?}", request);

        let id = request.id();
        let Some(state) = self.endpoints.get_mut(&request.endpoint()) else {
            warn!("USB URB reaped for undefined endpoint: {:?}", request);
            return Ok(Some(id));
        };
        if let Some(monitor) = state.monitor() {
            monitor.notify_completed(id);
        }
        state.completed.push_back(request);
        Ok(Some(id))
    }

    /// Reap until the kernel has nothing more
    pub(crate) fn reap_available(&mut self) -> Result<usize> {
        let mut reaped = 0;
        loop {
            match self.reap(false) {
                Ok(Some(_)) => reaped += 1,
                Ok(None) => return Ok(reaped),
                Err(UsbError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Completed request for an endpoint address
    ///
    /// Ownership of the request passes to the caller. Input data has already
    /// been through the filter chain.
    pub fn reap_response(&mut self, endpoint: u8, wait: bool) -> Result<Option<UsbResponse>> {
        loop {
            let state = self
                .endpoints
                .get_mut(&endpoint)
                .ok_or(UsbError::UndefinedEndpoint(endpoint))?;
            if let Some(request) = state.completed.pop_front() {
                return Ok(Some(self.deliver(request)));
            }

            if self.reap(wait)?.is_none() {
                return Ok(None);
            }
        }
    }

    pub(crate) fn deliver(&mut self, mut request: Box<TransferRequest>) -> UsbResponse {
        if let Some(errno) = request.status_errno() {
            debug!("USB request failed: {:?}", request);
            return UsbResponse::new(request, Err(errno));
        }

        let count = request.actual_length();
        let address = request.endpoint();
        if address & 0x80 == 0 {
            return UsbResponse::new(request, Ok(count));
        }

        trace!("URB input: {}", format_bytes(&request.buffer()[..count]));
        match self.filters.apply(address, request.buffer_mut(), count) {
            Some(count) => UsbResponse::new(request, Ok(count)),
            None => {
                debug!("USB input rejected by filter: {:#04x}", address);
                UsbResponse::new(request, Err(Errno::EIO))
            }
        }
    }

    /// Cancel a submitted request
    ///
    /// A request that has already completed is simply released. Otherwise the
    /// kernel is asked to discard it and completions are drained until it
    /// shows up, since it may complete while the discard is in progress.
    pub fn cancel_request(&mut self, id: RequestId) -> Result<()> {
        if self.take_queued(id).is_some() {
            debug!("USB request already completed: {}", id.0);
            return Ok(());
        }

        let found = self
            .in_flight
            .iter_mut()
            .find(|(_, request)| request.id() == id)
            .map(|(addr, request)| (*addr, request.endpoint(), request.urb_ptr()));
        let Some((addr, endpoint, urb)) = found else {
            return Err(UsbError::NotFound(format!("request {}", id.0)));
        };

        let node = self.node.get()?;
        match node.discard_urb(urb) {
            Ok(()) => {}
            Err(Errno::ENODEV) => {
                // Device gone: nothing left to reap.
                debug!("USB request discarded with device gone: {}", id.0);
                self.in_flight.remove(&addr);
                return Ok(());
            }
            Err(Errno::EINVAL) => trace!("USB request not discardable: {}", id.0),
            Err(errno) => error!("USB URB discard failed: {} ({})", errno, errno as i32),
        }

        loop {
            if let Some(state) = self.endpoints.get_mut(&endpoint) {
                if state.take_completed(id).is_some() {
                    debug!("USB request cancelled: {}", id.0);
                    return Ok(());
                }
            }

            match self.reap(false) {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!("USB request not reaped after discard: {}", id.0);
                    return Err(UsbError::NotFound(format!("request {}", id.0)));
                }
            }
        }
    }

    fn take_queued(&mut self, id: RequestId) -> Option<Box<TransferRequest>> {
        self.endpoints
            .values_mut()
            .find_map(|state| state.take_completed(id))
    }

    /// Read from input endpoint `number`
    ///
    /// Monitored endpoints are served from their buffer, waiting up to
    /// `timeout` for new input. A zero timeout checks once.
    pub fn read_endpoint(&mut self, number: u8, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let address = input_address(number);
        let descriptor = self.endpoint(address)?.descriptor;
        self.ensure_monitor(address);

        if self.has_monitored_input(address) {
            return self.read_monitored(address, buffer, timeout);
        }

        let count = match descriptor.transfer() {
            EndpointTransfer::Interrupt if !self.settings.treat_interrupt_as_bulk => {
                self.interrupt_transfer(address, buffer, timeout)?
            }
            EndpointTransfer::Bulk | EndpointTransfer::Interrupt => {
                self.bulk_transfer(address, buffer, timeout)?
            }
            other => {
                return Err(UsbError::NotSupported(format!("{:?} input", other)));
            }
        };

        self.filters
            .apply(address, buffer, count)
            .ok_or(UsbError::FilterRejected { endpoint: address })
    }

    /// Write to output endpoint `number`
    pub fn write_endpoint(&mut self, number: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let address = output_address(number);
        let descriptor = self.endpoint(address)?.descriptor;

        match descriptor.transfer() {
            EndpointTransfer::Bulk | EndpointTransfer::Interrupt => {
                let mut buffer = data.to_vec();
                self.bulk_transfer(address, &mut buffer, timeout)
            }
            other => Err(UsbError::NotSupported(format!("{:?} output", other))),
        }
    }

    /// One blocking bulk ioctl
    ///
    /// An input timeout means no data yet rather than failure.
    pub(crate) fn bulk_transfer(&mut self, address: u8, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let input = address & 0x80 != 0;
        if !input {
            trace!("bulk output {:#04x}: {}", address, format_bytes(buffer));
        }

        let node = self.node.get()?;
        match node.bulk(address, buffer, timeout_millis(timeout)) {
            Ok(count) => {
                if input {
                    trace!(
                        "bulk input {:#04x}: {}",
                        address,
                        format_bytes(&buffer[..count.min(buffer.len())])
                    );
                }
                Ok(count.min(buffer.len()))
            }
            Err(Errno::ETIMEDOUT) if input => Err(UsbError::NoData),
            Err(Errno::ETIMEDOUT) => {
                debug!("USB bulk output timed out: {:#04x}", address);
                Err(UsbError::Timeout)
            }
            Err(errno) => {
                error!("USB bulk transfer failed: {:#04x}: {} ({})", address, errno, errno as i32);
                Err(UsbError::device("bulk transfer", errno))
            }
        }
    }

    /// Submit one URB and poll until it completes or `timeout` elapses
    fn interrupt_transfer(&mut self, address: u8, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let interval = Duration::from_millis(u64::from(self.endpoint(address)?.descriptor.interval) + 1);
        let request = self.allocate_request(address, Some(&*buffer), buffer.len(), 0)?;
        let id = self.submit_request(request)?;
        let deadline = deadline_after(timeout);

        loop {
            self.reap_available()?;
            if let Some(request) = self
                .endpoints
                .get_mut(&address)
                .and_then(|state| state.take_completed(id))
            {
                if let Some(errno) = request.status_errno() {
                    error!("USB interrupt transfer failed: {:?}", request);
                    return Err(UsbError::device("interrupt transfer", errno));
                }
                let count = request.actual_length().min(buffer.len());
                if address & 0x80 != 0 {
                    buffer[..count].copy_from_slice(&request.data()[..count]);
                }
                return Ok(count);
            }

            let remaining = time_left(deadline, Instant::now());
            if remaining.is_zero() {
                if let Err(e) = self.cancel_request(id) {
                    warn!("USB interrupt request cancel failed: {}", e);
                }
                return Err(UsbError::Timeout);
            }
            self.handle_events(interval.min(remaining))?;
        }
    }

    /// Pump completions and timers for up to `timeout`
    ///
    /// Returns early once anything has completed. Due monitor timers cut
    /// the wait short.
    pub fn handle_events(&mut self, timeout: Duration) -> Result<()> {
        let now = Instant::now();
        let wait = match self.next_resubmission() {
            Some(at) => timeout.min(at.saturating_duration_since(now)),
            None => timeout,
        };

        let awaiting = !self.in_flight.is_empty() && self.node.is_open();
        if awaiting {
            let node = self.node.get()?;
            match node.wait_for_completion(wait) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => {
                    error!("USB completion poll failed: {} ({})", errno, errno as i32);
                    return Err(UsbError::device("completion poll", errno));
                }
            }
            self.reap_available()?;
        } else if !wait.is_zero() {
            thread::sleep(wait);
        }

        self.fire_due_resubmissions(Instant::now());
        self.dispatch_monitors();
        Ok(())
    }
}
