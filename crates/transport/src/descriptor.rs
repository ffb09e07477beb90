//! USB descriptor and setup-packet types
//!
//! Only the standard device descriptor is parsed from raw bytes. Endpoint
//! descriptors are supplied by the driver layer through
//! [`UsbDevice::define_endpoint`](crate::UsbDevice::define_endpoint).

use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use serde::Serialize;

/// Size in bytes of a standard device descriptor
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Byte order of the multi-byte descriptor fields in a raw buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorOrder {
    /// Straight from the device (wire order)
    LittleEndian,
    /// Already converted by the kernel (sysfs `descriptors`)
    Native,
}

/// Standard USB device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse the first [`DEVICE_DESCRIPTOR_SIZE`] bytes of `raw`
    ///
    /// Returns `None` for a short buffer.
    pub fn parse(raw: &[u8], order: DescriptorOrder) -> Option<Self> {
        if raw.len() < DEVICE_DESCRIPTOR_SIZE {
            return None;
        }

        let word = |offset: usize| match order {
            DescriptorOrder::LittleEndian => LittleEndian::read_u16(&raw[offset..offset + 2]),
            DescriptorOrder::Native => NativeEndian::read_u16(&raw[offset..offset + 2]),
        };

        Some(Self {
            length: raw[0],
            descriptor_type: raw[1],
            bcd_usb: word(2),
            device_class: raw[4],
            device_subclass: raw[5],
            device_protocol: raw[6],
            max_packet_size0: raw[7],
            vendor_id: word(8),
            product_id: word(10),
            bcd_device: word(12),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_number_index: raw[16],
            num_configurations: raw[17],
        })
    }
}

/// Direction bit of an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    /// Host to device
    Output,
    /// Device to host
    Input,
}

/// Transfer type bits of an endpoint's attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointTransfer {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointTransfer {
    fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointTransfer::Control,
            1 => EndpointTransfer::Isochronous,
            2 => EndpointTransfer::Bulk,
            _ => EndpointTransfer::Interrupt,
        }
    }

    fn attributes(self) -> u8 {
        match self {
            EndpointTransfer::Control => 0,
            EndpointTransfer::Isochronous => 1,
            EndpointTransfer::Bulk => 2,
            EndpointTransfer::Interrupt => 3,
        }
    }
}

/// Endpoint descriptor as declared by the driver layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (bit 7 = input)
    pub address: u8,
    /// bmAttributes (bits 0-1 = transfer type)
    pub attributes: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Input endpoint `number` of the given transfer type
    pub fn input(number: u8, transfer: EndpointTransfer, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: (number & 0x0f) | 0x80,
            attributes: transfer.attributes(),
            max_packet_size,
            interval,
        }
    }

    /// Output endpoint `number` of the given transfer type
    pub fn output(number: u8, transfer: EndpointTransfer, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: number & 0x0f,
            attributes: transfer.attributes(),
            max_packet_size,
            interval,
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.address & 0x80 != 0 {
            EndpointDirection::Input
        } else {
            EndpointDirection::Output
        }
    }

    pub fn transfer(&self) -> EndpointTransfer {
        EndpointTransfer::from_attributes(self.attributes)
    }
}

/// Direction of a control transfer's data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirection {
    Output = 0x00,
    Input = 0x80,
}

/// Request type field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Standard = 0x00,
    Class = 0x20,
    Vendor = 0x40,
}

/// Recipient field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecipient {
    Device = 0x00,
    Interface = 0x01,
    Endpoint = 0x02,
    Other = 0x03,
}

/// Host-order view of a control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(
        direction: ControlDirection,
        recipient: ControlRecipient,
        kind: ControlType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: direction as u8 | kind as u8 | recipient as u8,
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> ControlDirection {
        if self.request_type & 0x80 != 0 {
            ControlDirection::Input
        } else {
            ControlDirection::Output
        }
    }
}
