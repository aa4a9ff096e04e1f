use alloc::{string::String, vec::Vec};
use core::num::NonZeroU8;

use crate::{
    err::USBError,
    transfer::{Direction, EndpointType},
};

mod class_code;
mod config;

pub use class_code::*;
pub use config::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorType(pub u8);

impl DescriptorType {
    pub const DEVICE: Self = Self(0x01);
    pub const CONFIGURATION: Self = Self(0x02);
    pub const STRING: Self = Self(0x03);
    pub const INTERFACE: Self = Self(0x04);
    pub const ENDPOINT: Self = Self(0x05);
    pub const INTERFACE_ASSOCIATION: Self = Self(0x0B);
}

/// String descriptor index 0 holds the supported language IDs.
pub const STRING_INDEX_LANGID: u8 = 0;

/// English (United States).
pub const LANGID_EN_US: u16 = 0x0409;

/// The common `bLength` / `bDescriptorType` prefix of every descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeader {
    pub length: u8,
    pub descriptor_type: DescriptorType,
}

impl DescriptorHeader {
    pub const LEN: usize = 2;
}

/// A descriptor found inside a larger descriptor block.
#[derive(Debug, Clone, Copy)]
pub struct RawDescriptor<'a> {
    pub header: DescriptorHeader,
    /// Offset of the descriptor within the walked buffer.
    pub offset: usize,
    /// The whole descriptor, header included.
    pub data: &'a [u8],
}

/// Returns the descriptor at `offset` and advances `offset` past it.
///
/// Device supplied lengths are not trusted: a header shorter than two bytes
/// (which would never advance) or a descriptor running past the end of
/// `buffer` is rejected.
pub fn next_descriptor<'a>(
    buffer: &'a [u8],
    offset: &mut usize,
) -> Result<RawDescriptor<'a>, USBError> {
    let start = *offset;
    let Some(hdr) = buffer.get(start..start + DescriptorHeader::LEN) else {
        return Err(USBError::InvalidDescriptor);
    };
    let length = hdr[0] as usize;
    if length < DescriptorHeader::LEN {
        return Err(USBError::InvalidDescriptor);
    }
    let Some(data) = buffer.get(start..start + length) else {
        return Err(USBError::InvalidDescriptor);
    };
    *offset = start + length;
    Ok(RawDescriptor {
        header: DescriptorHeader {
            length: hdr[0],
            descriptor_type: DescriptorType(hdr[1]),
        },
        offset: start,
        data,
    })
}

/// Iterates over the descriptors of `buffer`, stopping at the first malformed
/// header.
pub fn descriptors(buffer: &[u8]) -> impl Iterator<Item = RawDescriptor<'_>> + '_ {
    let mut offset = 0;
    core::iter::from_fn(move || {
        if offset >= buffer.len() {
            return None;
        }
        next_descriptor(buffer, &mut offset).ok()
    })
}

fn le16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_string_index: Option<NonZeroU8>,
    pub product_string_index: Option<NonZeroU8>,
    pub serial_number_string_index: Option<NonZeroU8>,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;
    /// Enough of the descriptor to learn `bMaxPacketSize0`.
    pub const LEN_MIN: usize = 8;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[1] != DescriptorType::DEVICE.0 {
            return None;
        }
        Some(Self {
            length: data[0],
            usb_version: le16(data, 2),
            class: data[4],
            subclass: data[5],
            protocol: data[6],
            max_packet_size_0: data[7],
            vendor_id: le16(data, 8),
            product_id: le16(data, 10),
            device_version: le16(data, 12),
            manufacturer_string_index: NonZeroU8::new(data[14]),
            product_string_index: NonZeroU8::new(data[15]),
            serial_number_string_index: NonZeroU8::new(data[16]),
            num_configurations: data[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let usb = self.usb_version.to_le_bytes();
        let vid = self.vendor_id.to_le_bytes();
        let pid = self.product_id.to_le_bytes();
        let ver = self.device_version.to_le_bytes();
        let idx = |i: Option<NonZeroU8>| i.map(NonZeroU8::get).unwrap_or(0);
        [
            self.length,
            DescriptorType::DEVICE.0,
            usb[0],
            usb[1],
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size_0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            ver[0],
            ver[1],
            idx(self.manufacturer_string_index),
            idx(self.product_string_index),
            idx(self.serial_number_string_index),
            self.num_configurations,
        ]
    }

    pub fn class(&self) -> BaseClass {
        BaseClass::from(self.class)
    }
}

bitflags::bitflags! {
    /// `bmAttributes` of a configuration descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigAttributes: u8 {
        const RESERVED_ONE = 0x80;
        const SELF_POWERED = 0x40;
        const REMOTE_WAKEUP = 0x20;
        const _ = !0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: Option<NonZeroU8>,
    pub attributes: ConfigAttributes,
    /// In units of 2 mA.
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LEN: usize = 9;
    /// 500 mA.
    pub const MAX_POWER_LIMIT: u8 = 250;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[1] != DescriptorType::CONFIGURATION.0 {
            return None;
        }
        Some(Self {
            length: data[0],
            total_length: le16(data, 2),
            num_interfaces: data[4],
            configuration_value: data[5],
            string_index: NonZeroU8::new(data[6]),
            attributes: ConfigAttributes::from_bits_retain(data[7]),
            max_power: data[8],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let total = self.total_length.to_le_bytes();
        [
            self.length,
            DescriptorType::CONFIGURATION.0,
            total[0],
            total[1],
            self.num_interfaces,
            self.configuration_value,
            self.string_index.map(NonZeroU8::get).unwrap_or(0),
            self.attributes.bits(),
            self.max_power,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: Option<NonZeroU8>,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[1] != DescriptorType::INTERFACE.0 {
            return None;
        }
        Some(Self {
            length: data[0],
            interface_number: data[2],
            alternate_setting: data[3],
            num_endpoints: data[4],
            class: data[5],
            subclass: data[6],
            protocol: data[7],
            string_index: NonZeroU8::new(data[8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        [
            self.length,
            DescriptorType::INTERFACE.0,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.class,
            self.subclass,
            self.protocol,
            self.string_index.map(NonZeroU8::get).unwrap_or(0),
        ]
    }

    pub fn class(&self) -> BaseClass {
        BaseClass::from(self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// 7, or 9 for audio class isochronous endpoints.
    pub length: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub refresh: u8,
    pub sync_address: u8,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;
    pub const LEN_AUDIO: usize = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[1] != DescriptorType::ENDPOINT.0 {
            return None;
        }
        let attributes = data[3];
        let (refresh, sync_address) = if data.len() >= Self::LEN_AUDIO
            && data[0] as usize >= Self::LEN_AUDIO
            && EndpointType::from_attributes(attributes) == EndpointType::Isochronous
        {
            (data[7], data[8])
        } else {
            (0, 0)
        };
        Some(Self {
            length: data[0],
            address: data[2],
            attributes,
            max_packet_size: le16(data, 4),
            interval: data[6],
            refresh,
            sync_address,
        })
    }

    /// Descriptor for the default control pipe, which never appears in a
    /// configuration block.
    pub fn control_default(max_packet_size: u16) -> Self {
        Self {
            length: Self::LEN as u8,
            address: 0,
            attributes: EndpointType::Control as u8,
            max_packet_size,
            interval: 0,
            refresh: 0,
            sync_address: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mps = self.max_packet_size.to_le_bytes();
        let mut out = alloc::vec![
            self.length,
            DescriptorType::ENDPOINT.0,
            self.address,
            self.attributes,
            mps[0],
            mps[1],
            self.interval,
        ];
        if self.length as usize >= Self::LEN_AUDIO {
            out.push(self.refresh);
            out.push(self.sync_address);
        }
        out
    }

    pub fn number(&self) -> u8 {
        self.address & 0x7F
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// `None` for control endpoints, which are bidirectional.
    pub fn direction(&self) -> Option<Direction> {
        match self.transfer_type() {
            EndpointType::Control => None,
            _ => Some(Direction::from_address(self.address)),
        }
    }

    /// Packet size without the high-bandwidth multiplier bits.
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }
}

/// Decodes the UTF-16LE payload of a string descriptor.
pub fn decode_string_descriptor(data: &[u8]) -> Result<String, USBError> {
    if data.len() < DescriptorHeader::LEN || data[1] != DescriptorType::STRING.0 {
        return Err(USBError::InvalidDescriptor);
    }
    let len = (data[0] as usize).min(data.len());
    if len < DescriptorHeader::LEN {
        return Err(USBError::InvalidDescriptor);
    }
    let units = data[DescriptorHeader::LEN..len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0);
    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
