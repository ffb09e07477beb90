//! Asynchronous input monitor
//!
//! A monitored input endpoint always has exactly one request either in
//! flight or parked waiting for its resubmission time:
//!
//! ```text
//!   Idle ──prepare──► Armed ──Completed──► data?  ──► buffer/callback, reset delay ─┐
//!                       ▲                   empty? ──► double delay (capped) ───────┤
//!                       │                   error? ──► record, Idle                 │
//!                       └──────────── ResubmitDue / immediate ◄─────────────────────┘
//! ```
//!
//! Events arrive through the endpoint's [`CompletionToken`] and are consumed
//! from [`UsbDevice::handle_events`]. Any fault ends monitoring for that
//! endpoint only; reads then report the fault once and go synchronous.

use crate::completion::{CompletionEvent, CompletionToken};
use crate::descriptor::{EndpointDescriptor, EndpointTransfer};
use crate::device::UsbDevice;
use crate::endpoint::{EndpointState, InputState};
use crate::error::{Result, UsbError};
use crate::request::{RequestId, TransferRequest};
use crate::settings::TransportSettings;
use crate::transfer::{deadline_after, input_address, time_left};
use nix::errno::Errno;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// A block of input delivered to a monitor callback
#[derive(Debug, Clone, Copy)]
pub struct InputNotice<'a> {
    /// Endpoint address the block came from
    pub endpoint: u8,
    /// Filtered input bytes
    pub data: &'a [u8],
}

/// Consumer callback; returning false unregisters it
pub type InputCallback = Box<dyn FnMut(&InputNotice<'_>) -> bool>;

/// Backoff an empty completion grows from when the nominal interval is zero
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Next resubmission interval after an empty completion
pub fn next_backoff(delay: Duration, max: Duration) -> Duration {
    if delay.is_zero() {
        return MIN_BACKOFF.min(max);
    }
    delay.saturating_mul(2).min(max)
}

/// Resubmission interval an endpoint starts from and returns to on data
pub fn nominal_interval(descriptor: &EndpointDescriptor, settings: &TransportSettings) -> Duration {
    match descriptor.interval {
        0 => Duration::from_millis(u64::from(settings.resubmit_delay_ms)),
        interval => Duration::from_millis(u64::from(interval)),
    }
}

pub(crate) struct InputMonitor {
    token: CompletionToken,
    /// Request currently owned by the kernel
    in_flight: Option<RequestId>,
    /// Request waiting for its resubmission time
    parked: Option<Box<TransferRequest>>,
    nominal: Duration,
    delay: Duration,
    max: Duration,
    resubmit_at: Option<Instant>,
}

impl InputMonitor {
    pub fn notify_completed(&self, id: RequestId) {
        if !self.token.post(CompletionEvent::Completed(id)) {
            warn!("USB input completion dropped: {}", id.0);
        }
    }

    fn next_event(&self) -> Option<CompletionEvent> {
        self.token.next_event()
    }
}

fn input_state(endpoints: &mut std::collections::BTreeMap<u8, EndpointState>, address: u8) -> Option<&mut InputState> {
    endpoints.get_mut(&address)?.input.as_mut()
}

impl UsbDevice {
    /// Deliver input from endpoint `number` to `callback` as it arrives
    ///
    /// The callback runs inside [`UsbDevice::handle_events`] and must not
    /// block. Blocks it receives are not buffered for `read_endpoint`.
    pub fn monitor_input_endpoint<F>(&mut self, number: u8, callback: F) -> Result<()>
    where
        F: FnMut(&InputNotice<'_>) -> bool + 'static,
    {
        let address = input_address(number);
        self.endpoint(address)?;
        self.ensure_monitor(address);

        match input_state(&mut self.endpoints, address) {
            Some(input) if input.monitor.is_some() => {
                input.callback = Some(Box::new(callback));
                debug!("USB input callback registered: {:#04x}", address);
                Ok(())
            }
            _ => Err(UsbError::NotSupported(format!(
                "monitoring of endpoint {:#04x}",
                address
            ))),
        }
    }

    /// Whether input endpoint `number` is being monitored
    pub fn is_monitoring(&self, number: u8) -> bool {
        self.endpoints
            .get(&input_address(number))
            .and_then(EndpointState::monitor)
            .is_some()
    }

    /// Current resubmission interval of a monitored endpoint
    pub fn input_backoff(&self, number: u8) -> Option<Duration> {
        self.endpoints
            .get(&input_address(number))
            .and_then(EndpointState::monitor)
            .map(|monitor| monitor.delay)
    }

    /// Arm the monitor on first use of an input endpoint
    pub(crate) fn ensure_monitor(&mut self, address: u8) {
        if !self.settings.input_monitor {
            return;
        }
        let Some(input) = input_state(&mut self.endpoints, address) else {
            return;
        };
        if input.prepared {
            return;
        }
        input.prepared = true;

        if let Err(e) = self.prepare_monitor(address) {
            warn!("USB input monitor unavailable: {:#04x}: {}", address, e);
        }
    }

    fn prepare_monitor(&mut self, address: u8) -> Result<()> {
        let descriptor = self.endpoint(address)?.descriptor;
        if !matches!(
            descriptor.transfer(),
            EndpointTransfer::Bulk | EndpointTransfer::Interrupt
        ) || descriptor.max_packet_size == 0
        {
            return Err(UsbError::NotSupported(format!(
                "monitoring of {:?} endpoint",
                descriptor.transfer()
            )));
        }

        let token = self
            .hub
            .obtain()
            .ok_or_else(|| UsbError::NotSupported("free completion slot".to_string()))?;

        let submitted = self
            .allocate_request(address, None, usize::from(descriptor.max_packet_size), 0)
            .and_then(|request| self.submit_request(request));
        let id = match submitted {
            Ok(id) => id,
            Err(e) => {
                self.hub.relinquish(token);
                return Err(e);
            }
        };

        let nominal = nominal_interval(&descriptor, &self.settings);
        let monitor = InputMonitor {
            token,
            in_flight: Some(id),
            parked: None,
            nominal,
            delay: nominal,
            max: Duration::from_millis(u64::from(self.settings.max_backoff_ms)),
            resubmit_at: None,
        };

        match input_state(&mut self.endpoints, address) {
            Some(input) => {
                input.monitor = Some(monitor);
                debug!("USB input monitor armed: {:#04x} interval={:?}", address, nominal);
                Ok(())
            }
            None => Err(UsbError::UndefinedEndpoint(address)),
        }
    }

    pub(crate) fn has_monitored_input(&self, address: u8) -> bool {
        self.endpoints
            .get(&address)
            .and_then(|state| state.input.as_ref())
            .is_some_and(|input| {
                input.monitor.is_some() || !input.buffer.is_empty() || input.error.is_some()
            })
    }

    /// Serve a read from the monitor's buffer
    pub(crate) fn read_monitored(
        &mut self,
        address: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = deadline_after(timeout);

        loop {
            let input = input_state(&mut self.endpoints, address)
                .ok_or(UsbError::UndefinedEndpoint(address))?;

            if !input.buffer.is_empty() {
                let count = buffer.len().min(input.buffer.len());
                let block = input.buffer.split_to(count);
                buffer[..count].copy_from_slice(&block);
                return Ok(count);
            }
            if let Some(errno) = input.error.take() {
                return Err(UsbError::device("input monitor", errno));
            }

            let remaining = time_left(deadline, Instant::now());
            if input.monitor.is_none() {
                return self.read_endpoint(address, buffer, remaining);
            }
            if remaining.is_zero() {
                return Err(UsbError::NoData);
            }
            self.handle_events(remaining)?;
        }
    }

    /// Earliest pending resubmission time
    pub(crate) fn next_resubmission(&self) -> Option<Instant> {
        self.endpoints
            .values()
            .filter_map(|state| state.monitor()?.resubmit_at)
            .min()
    }

    pub(crate) fn fire_due_resubmissions(&mut self, now: Instant) {
        for state in self.endpoints.values_mut() {
            let Some(monitor) = state.monitor_mut() else {
                continue;
            };
            if monitor.resubmit_at.is_some_and(|at| at <= now) {
                monitor.resubmit_at = None;
                monitor.token.post(CompletionEvent::ResubmitDue);
            }
        }
    }

    /// Run every monitor's queued events
    pub(crate) fn dispatch_monitors(&mut self) {
        let addresses: Vec<u8> = self
            .endpoints
            .iter()
            .filter(|(_, state)| state.monitor().is_some())
            .map(|(address, _)| *address)
            .collect();

        for address in addresses {
            loop {
                let event = match self.endpoints.get(&address).and_then(EndpointState::monitor) {
                    Some(monitor) => monitor.next_event(),
                    None => break,
                };
                match event {
                    Some(CompletionEvent::Completed(id)) => self.monitor_completed(address, id),
                    Some(CompletionEvent::ResubmitDue) => self.monitor_resubmit(address),
                    None => break,
                }
            }
        }
    }

    fn monitor_completed(&mut self, address: u8, id: RequestId) {
        let Some(expected) = self
            .endpoints
            .get(&address)
            .and_then(EndpointState::monitor)
            .map(|monitor| monitor.in_flight)
        else {
            return;
        };
        trace!("USB input completion: {:#04x} request={}", address, id.0);

        // Other requests on this endpoint stay queued for their owner.
        if Some(id) != expected {
            error!(
                "unexpected USB input request: {:#04x} got={} expected={:?}",
                address,
                id.0,
                expected.map(|id| id.0)
            );
            self.fail_monitor(address, Errno::EIO);
            return;
        }

        let Some(request) = self
            .endpoints
            .get_mut(&address)
            .and_then(|state| state.take_completed(id))
        else {
            warn!("USB input response missing: {:#04x}", address);
            self.fail_monitor(address, Errno::EIO);
            return;
        };
        if let Some(monitor) = self.endpoints.get_mut(&address).and_then(EndpointState::monitor_mut) {
            monitor.in_flight = None;
        }
        let response = self.deliver(request);

        match response.count() {
            Err(_) if response.filter_rejected() => {
                warn!("USB input block rejected by filter: {:#04x}", address);
                self.fail_monitor(address, Errno::EIO);
            }
            Err(errno) => {
                warn!("USB input transfer failed: {:#04x}: {} ({})", address, errno, errno as i32);
                self.fail_monitor(address, errno);
            }
            Ok(0) => self.reschedule(address, response.into_request(), true),
            Ok(_) => {
                self.consume_input(address, response.data());
                self.reschedule(address, response.into_request(), false);
            }
        }
    }

    fn consume_input(&mut self, address: u8, data: &[u8]) {
        let Some(input) = input_state(&mut self.endpoints, address) else {
            return;
        };
        let notice = InputNotice {
            endpoint: address,
            data,
        };

        match input.callback.take() {
            Some(mut callback) => {
                if callback(&notice) {
                    input.callback = Some(callback);
                } else {
                    debug!("USB input callback unregistered: {:#04x}", address);
                }
            }
            None => input.buffer.extend_from_slice(data),
        }
    }

    /// Park the request with an updated delay, or resubmit it right away
    fn reschedule(&mut self, address: u8, request: Box<TransferRequest>, empty: bool) {
        let Some(monitor) = self.endpoints.get_mut(&address).and_then(EndpointState::monitor_mut) else {
            return;
        };

        monitor.delay = if empty {
            next_backoff(monitor.delay, monitor.max)
        } else {
            monitor.nominal
        };

        if !empty && monitor.delay.is_zero() {
            self.resubmit_monitored(address, request);
            return;
        }

        trace!("USB input resubmission in {:?}: {:#04x}", monitor.delay, address);
        monitor.resubmit_at = Some(Instant::now() + monitor.delay);
        monitor.parked = Some(request);
    }

    fn monitor_resubmit(&mut self, address: u8) {
        let Some(request) = self
            .endpoints
            .get_mut(&address)
            .and_then(EndpointState::monitor_mut)
            .and_then(|monitor| monitor.parked.take())
        else {
            return;
        };
        self.resubmit_monitored(address, request);
    }

    fn resubmit_monitored(&mut self, address: u8, mut request: Box<TransferRequest>) {
        request.reset();
        match self.submit_request(request) {
            Ok(id) => {
                if let Some(monitor) = self.endpoints.get_mut(&address).and_then(EndpointState::monitor_mut) {
                    monitor.in_flight = Some(id);
                }
            }
            Err(e) => {
                error!("USB input resubmission failed: {:#04x}: {}", address, e);
                self.fail_monitor(address, e.errno().unwrap_or(Errno::EIO));
            }
        }
    }

    /// Record a fault and stop monitoring the endpoint
    fn fail_monitor(&mut self, address: u8, errno: Errno) {
        if let Some(input) = input_state(&mut self.endpoints, address) {
            input.error = Some(errno);
        }
        self.stop_monitor(address);
    }

    /// Tear down an endpoint's monitor, if it has one
    pub(crate) fn stop_monitor(&mut self, address: u8) {
        let Some(monitor) = input_state(&mut self.endpoints, address).and_then(|input| input.monitor.take())
        else {
            return;
        };

        if let Some(id) = monitor.in_flight {
            if let Err(e) = self.cancel_request(id) {
                debug!("USB input request cancel failed: {}", e);
            }
        }
        self.hub.relinquish(monitor.token);
        debug!("USB input monitor stopped: {:#04x}", address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let max = Duration::from_millis(40);
        let mut delay = Duration::from_millis(8);
        let mut seen = Vec::new();
        for _ in 0..4 {
            delay = next_backoff(delay, max);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![16, 32, 40, 40]);
    }

    #[test]
    fn test_backoff_grows_from_zero_delay() {
        let max = Duration::from_millis(40);
        assert_eq!(next_backoff(Duration::ZERO, max), Duration::from_millis(1));
        assert_eq!(next_backoff(Duration::from_millis(1), max), Duration::from_millis(2));
        assert_eq!(next_backoff(Duration::ZERO, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_nominal_interval_defaults_for_zero() {
        let settings = TransportSettings::default();
        let endpoint = EndpointDescriptor::input(1, EndpointTransfer::Bulk, 64, 0);
        assert_eq!(
            nominal_interval(&endpoint, &settings),
            Duration::from_millis(u64::from(settings.resubmit_delay_ms))
        );

        let endpoint = EndpointDescriptor::input(1, EndpointTransfer::Interrupt, 8, 10);
        assert_eq!(nominal_interval(&endpoint, &settings), Duration::from_millis(10));
    }

    proptest! {
        #[test]
        fn prop_backoff_is_capped_shift(nominal in 0u64..100, max in 0u64..1000, steps in 0u32..20) {
            let max = Duration::from_millis(max);
            let mut delay = Duration::from_millis(nominal);
            for _ in 0..steps {
                delay = next_backoff(delay, max);
            }

            let expected = match (nominal, steps) {
                (nominal, 0) => Duration::from_millis(nominal),
                (0, steps) => Duration::from_millis(1 << (steps - 1)).min(max),
                (nominal, steps) => Duration::from_millis(nominal << steps).min(max),
            };
            prop_assert_eq!(delay, expected);
        }
    }
}
