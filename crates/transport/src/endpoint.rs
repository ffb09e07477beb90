//! Per-endpoint bookkeeping

use crate::descriptor::{EndpointDescriptor, EndpointDirection};
use crate::monitor::{InputCallback, InputMonitor};
use crate::request::{RequestId, TransferRequest};
use bytes::BytesMut;
use nix::errno::Errno;
use std::collections::VecDeque;

/// State of one defined endpoint
pub(crate) struct EndpointState {
    pub descriptor: EndpointDescriptor,
    /// Reaped requests in kernel completion order
    pub completed: VecDeque<Box<TransferRequest>>,
    /// Interrupt submissions go out as Bulk after the kernel rejected one
    pub interrupt_as_bulk: bool,
    /// Present only on input endpoints
    pub input: Option<InputState>,
}

/// Input-only part of an endpoint
#[derive(Default)]
pub(crate) struct InputState {
    /// Set once monitor preparation has been attempted
    pub prepared: bool,
    pub monitor: Option<InputMonitor>,
    /// Filtered bytes waiting for `read_endpoint`
    pub buffer: BytesMut,
    /// Fault that ended monitoring, reported once
    pub error: Option<Errno>,
    pub callback: Option<InputCallback>,
}

impl EndpointState {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        let input = match descriptor.direction() {
            EndpointDirection::Input => Some(InputState::default()),
            EndpointDirection::Output => None,
        };

        Self {
            descriptor,
            completed: VecDeque::new(),
            interrupt_as_bulk: false,
            input,
        }
    }

    /// Remove a specific request from the completed queue
    pub fn take_completed(&mut self, id: RequestId) -> Option<Box<TransferRequest>> {
        let position = self.completed.iter().position(|request| request.id() == id)?;
        self.completed.remove(position)
    }

    pub fn monitor(&self) -> Option<&InputMonitor> {
        self.input.as_ref()?.monitor.as_ref()
    }

    pub fn monitor_mut(&mut self) -> Option<&mut InputMonitor> {
        self.input.as_mut()?.monitor.as_mut()
    }
}
