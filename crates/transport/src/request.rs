//! Transfer requests (URBs)
//!
//! A [`TransferRequest`] owns its data buffer and the kernel URB header that
//! points into it. Requests are always boxed so the header keeps a stable
//! address while the kernel holds it.

use crate::descriptor::{EndpointDescriptor, EndpointDirection, EndpointTransfer};
use crate::error::{Result, UsbError};
use crate::usbfs::{
    URB_BULK_CONTINUATION, URB_ISO_ASAP, URB_NO_FSBR, URB_NO_INTERRUPT, URB_SHORT_NOT_OK,
    URB_TYPE_BULK, URB_TYPE_CONTROL, URB_TYPE_INTERRUPT, URB_TYPE_ISO, URB_ZERO_PACKET,
    UsbdevfsUrb,
};
use nix::errno::Errno;
use std::fmt;
use std::ptr;

/// Identifier of a submitted request, unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Transfer type carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferKind {
    pub(crate) fn urb_type(self) -> u8 {
        match self {
            TransferKind::Control => URB_TYPE_CONTROL,
            TransferKind::Bulk => URB_TYPE_BULK,
            TransferKind::Interrupt => URB_TYPE_INTERRUPT,
            TransferKind::Isochronous => URB_TYPE_ISO,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TransferKind::Control => "ctl",
            TransferKind::Bulk => "blk",
            TransferKind::Interrupt => "int",
            TransferKind::Isochronous => "iso",
        }
    }
}

impl From<EndpointTransfer> for TransferKind {
    fn from(transfer: EndpointTransfer) -> Self {
        match transfer {
            EndpointTransfer::Control => TransferKind::Control,
            EndpointTransfer::Isochronous => TransferKind::Isochronous,
            EndpointTransfer::Bulk => TransferKind::Bulk,
            EndpointTransfer::Interrupt => TransferKind::Interrupt,
        }
    }
}

/// A single in-flight or completed transfer
pub struct TransferRequest {
    urb: UsbdevfsUrb,
    buffer: Vec<u8>,
    id: RequestId,
    kind: TransferKind,
    context: u64,
}

impl TransferRequest {
    /// Build a request sized to `length` for `endpoint`
    ///
    /// `data` is copied in only for output endpoints.
    pub(crate) fn allocate(
        id: RequestId,
        endpoint: &EndpointDescriptor,
        data: Option<&[u8]>,
        length: usize,
        context: u64,
    ) -> Result<Box<Self>> {
        let buffer_length = i32::try_from(length)
            .map_err(|_| UsbError::NotSupported(format!("request of {} bytes", length)))?;

        let mut buffer = vec![0u8; length];
        if let (Some(data), EndpointDirection::Output) = (data, endpoint.direction()) {
            let count = data.len().min(length);
            buffer[..count].copy_from_slice(&data[..count]);
        }

        let kind = TransferKind::from(endpoint.transfer());
        let mut request = Box::new(Self {
            urb: UsbdevfsUrb {
                urb_type: kind.urb_type(),
                endpoint: endpoint.address,
                buffer_length,
                usercontext: id.0 as usize as *mut _,
                ..UsbdevfsUrb::default()
            },
            buffer,
            id,
            kind,
            context,
        });

        request.urb.buffer = if length == 0 {
            ptr::null_mut()
        } else {
            request.buffer.as_mut_ptr().cast()
        };
        Ok(request)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.urb.endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn flags(&self) -> u32 {
        self.urb.flags
    }

    /// Size of the owned buffer
    pub fn requested_length(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes the kernel reported as transferred
    pub fn actual_length(&self) -> usize {
        usize::try_from(self.urb.actual_length)
            .unwrap_or(0)
            .min(self.buffer.len())
    }

    /// Completion status (0 = success, otherwise a negative errno)
    pub fn status(&self) -> i32 {
        self.urb.status
    }

    pub(crate) fn status_errno(&self) -> Option<Errno> {
        match self.urb.status {
            0 => None,
            status => Some(Errno::from_raw(status.abs())),
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The transferred bytes
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length()]
    }

    pub(crate) fn retype(&mut self, kind: TransferKind) {
        self.kind = kind;
        self.urb.urb_type = kind.urb_type();
    }

    /// Clear completion state ahead of a resubmission
    pub(crate) fn reset(&mut self) {
        self.urb.status = 0;
        self.urb.actual_length = 0;
        self.urb.error_count = 0;
    }

    /// Address handed to the kernel
    pub(crate) fn urb_ptr(&mut self) -> *mut UsbdevfsUrb {
        &mut self.urb
    }

    pub(crate) fn urb_addr(&self) -> usize {
        &self.urb as *const UsbdevfsUrb as usize
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id:{} Adr:{:#x} Ept:{:02X} Typ:{}({}) Flg:{:02X}",
            self.id.0,
            self.urb_addr(),
            self.urb.endpoint,
            self.urb.urb_type,
            self.kind.label(),
            self.urb.flags,
        )?;

        let names = [
            (URB_SHORT_NOT_OK, "spd"),
            (URB_ISO_ASAP, "isa"),
            (URB_BULK_CONTINUATION, "bkc"),
            (URB_NO_FSBR, "nof"),
            (URB_ZERO_PACKET, "zpk"),
            (URB_NO_INTERRUPT, "noi"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.urb.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if !set.is_empty() {
            write!(f, "({})", set.join(","))?;
        }

        write!(
            f,
            " Siz:{} Len:{} Err:{}",
            self.urb.buffer_length, self.urb.actual_length, self.urb.status
        )?;
        if let Some(errno) = self.status_errno() {
            write!(f, "({})", errno.desc())?;
        }
        Ok(())
    }
}

/// A reaped request handed over to the caller
#[derive(Debug)]
pub struct UsbResponse {
    request: Box<TransferRequest>,
    outcome: std::result::Result<usize, Errno>,
}

impl UsbResponse {
    pub(crate) fn new(
        request: Box<TransferRequest>,
        outcome: std::result::Result<usize, Errno>,
    ) -> Self {
        Self { request, outcome }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    pub fn endpoint(&self) -> u8 {
        self.request.endpoint()
    }

    pub fn context(&self) -> u64 {
        self.request.context()
    }

    /// Size of the request's buffer
    pub fn size(&self) -> usize {
        self.request.requested_length()
    }

    /// Byte count after input filtering, or the failure status
    pub fn count(&self) -> std::result::Result<usize, Errno> {
        self.outcome
    }

    pub fn error(&self) -> Option<Errno> {
        self.outcome.err()
    }

    /// The transfer succeeded but the input filter chain rejected the block
    pub fn filter_rejected(&self) -> bool {
        self.outcome.is_err() && self.request.status() == 0
    }

    /// The delivered bytes (empty on failure)
    pub fn data(&self) -> &[u8] {
        match self.outcome {
            Ok(count) => &self.request.buffer()[..count.min(self.request.requested_length())],
            Err(_) => &[],
        }
    }

    pub fn into_request(self) -> Box<TransferRequest> {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_data_copied() {
        let endpoint = EndpointDescriptor::output(2, EndpointTransfer::Bulk, 64, 0);
        let request =
            TransferRequest::allocate(RequestId(1), &endpoint, Some(&[1, 2, 3]), 8, 7).unwrap();
        assert_eq!(&request.buffer()[..3], &[1, 2, 3]);
        assert_eq!(request.requested_length(), 8);
        assert_eq!(request.kind(), TransferKind::Bulk);
        assert_eq!(request.context(), 7);
    }

    #[test]
    fn test_input_data_not_copied() {
        let endpoint = EndpointDescriptor::input(1, EndpointTransfer::Interrupt, 64, 10);
        let request =
            TransferRequest::allocate(RequestId(2), &endpoint, Some(&[9, 9]), 4, 0).unwrap();
        assert_eq!(request.buffer(), &[0, 0, 0, 0]);
        assert_eq!(request.kind(), TransferKind::Interrupt);
        assert_eq!(request.endpoint(), 0x81);
    }

    #[test]
    fn test_zero_length_request_has_no_buffer() {
        let endpoint = EndpointDescriptor::output(2, EndpointTransfer::Bulk, 64, 0);
        let mut request = TransferRequest::allocate(RequestId(3), &endpoint, None, 0, 0).unwrap();
        let urb = request.urb_ptr();
        assert!(unsafe { (*urb).buffer.is_null() });
    }

    #[test]
    fn test_retype_updates_urb() {
        let endpoint = EndpointDescriptor::input(1, EndpointTransfer::Interrupt, 8, 1);
        let mut request = TransferRequest::allocate(RequestId(4), &endpoint, None, 8, 0).unwrap();
        request.retype(TransferKind::Bulk);
        assert_eq!(request.kind(), TransferKind::Bulk);
        assert!(format!("{:?}", request).contains("Typ:3(blk)"));
    }

    #[test]
    fn test_status_errno() {
        let endpoint = EndpointDescriptor::input(1, EndpointTransfer::Bulk, 8, 0);
        let mut request = TransferRequest::allocate(RequestId(5), &endpoint, None, 8, 0).unwrap();
        assert_eq!(request.status_errno(), None);
        request.urb.status = -(Errno::EPIPE as i32);
        assert_eq!(request.status_errno(), Some(Errno::EPIPE));
    }
}
