use alloc::vec::Vec;
use core::ops::Range;

use super::{
    BaseClass, ConfigurationDescriptor, DescriptorType, EndpointDescriptor, InterfaceDescriptor,
    next_descriptor,
};
use crate::err::USBError;

/// Hard USB limit on endpoints advertised by one interface descriptor.
pub const MAX_ENDPOINTS_PER_INTERFACE: u8 = 30;

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_interfaces: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_interfaces: 8 }
    }
}

/// A validated configuration block as read from the device.
#[derive(Debug, Clone)]
pub struct Configuration {
    raw: Vec<u8>,
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<InterfaceSpan>,
}

#[derive(Debug, Clone)]
struct InterfaceSpan {
    number: u8,
    range: Range<usize>,
}

/// Validates `raw` and records, for every interface, the bytes covering all
/// of its alternate settings.
pub fn parse_configuration(raw: Vec<u8>, limits: ParseLimits) -> Result<Configuration, USBError> {
    let descriptor = ConfigurationDescriptor::parse(&raw).ok_or(USBError::InvalidDescriptor)?;
    let total = descriptor.total_length as usize;
    if total > raw.len() || total < ConfigurationDescriptor::LEN {
        debug!("config: total length {total} does not fit {} bytes", raw.len());
        return Err(USBError::InvalidDescriptor);
    }
    if descriptor.max_power > ConfigurationDescriptor::MAX_POWER_LIMIT {
        debug!("config: max power {} out of range", descriptor.max_power);
        return Err(USBError::InvalidDescriptor);
    }
    let num_interfaces = descriptor.num_interfaces as usize;
    if num_interfaces == 0 || num_interfaces > limits.max_interfaces {
        debug!("config: {num_interfaces} interfaces, limit {}", limits.max_interfaces);
        return Err(USBError::InvalidDescriptor);
    }

    let body = &raw[..total];
    let mut offset = descriptor.length as usize;
    if offset < ConfigurationDescriptor::LEN {
        return Err(USBError::InvalidDescriptor);
    }

    let mut interfaces: Vec<InterfaceSpan> = Vec::new();
    while offset < total {
        let desc = next_descriptor(body, &mut offset)?;
        match desc.header.descriptor_type {
            DescriptorType::INTERFACE => {
                let intf =
                    InterfaceDescriptor::parse(desc.data).ok_or(USBError::InvalidDescriptor)?;
                if !intf.class().supported_by_interface() {
                    debug!("config: interface class {:#04x} not supported", intf.class);
                    return Err(USBError::InvalidDescriptor);
                }
                if intf.num_endpoints > MAX_ENDPOINTS_PER_INTERFACE {
                    return Err(USBError::InvalidDescriptor);
                }
                if intf.alternate_setting == 0 {
                    if interfaces.len() == limits.max_interfaces {
                        return Err(USBError::InvalidDescriptor);
                    }
                    if let Some(last) = interfaces.last_mut() {
                        last.range.end = desc.offset;
                    }
                    interfaces.push(InterfaceSpan {
                        number: intf.interface_number,
                        range: desc.offset..total,
                    });
                }
            }
            DescriptorType::ENDPOINT => {
                let ep = EndpointDescriptor::parse(desc.data).ok_or(USBError::InvalidDescriptor)?;
                if ep.address & 0x7F == 0 || ep.max_packet_size == 0 {
                    debug!("config: bad endpoint {:#04x}", ep.address);
                    return Err(USBError::InvalidDescriptor);
                }
            }
            DescriptorType::CONFIGURATION | DescriptorType::DEVICE => {
                return Err(USBError::InvalidDescriptor);
            }
            other => trace!("config: skipping descriptor type {:#04x}", other.0),
        }
    }

    if interfaces.len() != num_interfaces {
        debug!(
            "config: found {} interfaces, header says {num_interfaces}",
            interfaces.len()
        );
        return Err(USBError::InvalidDescriptor);
    }

    let mut raw = raw;
    raw.truncate(total);
    Ok(Configuration {
        raw,
        descriptor,
        interfaces,
    })
}

impl Configuration {
    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn configuration_value(&self) -> u8 {
        self.descriptor.configuration_value
    }

    pub fn num_interfaces(&self) -> usize {
        self.interfaces.len()
    }

    /// Class or vendor specific bytes between the configuration header and the
    /// first interface (or interface association) descriptor.
    pub fn extra(&self) -> &[u8] {
        let start = self.descriptor.length as usize;
        let mut offset = start;
        while offset < self.raw.len() {
            let at = offset;
            let Ok(desc) = next_descriptor(&self.raw, &mut offset) else {
                break;
            };
            if matches!(
                desc.header.descriptor_type,
                DescriptorType::INTERFACE | DescriptorType::INTERFACE_ASSOCIATION
            ) {
                return &self.raw[start..at];
            }
        }
        &self.raw[start..offset.min(self.raw.len())]
    }

    /// Interface by position in the configuration.
    pub fn interface(&self, index: usize) -> Option<InterfaceRef<'_>> {
        let span = self.interfaces.get(index)?;
        Some(InterfaceRef {
            number: span.number,
            data: &self.raw[span.range.clone()],
        })
    }

    /// Interface by its `bInterfaceNumber`.
    pub fn interface_by_number(&self, number: u8) -> Option<InterfaceRef<'_>> {
        self.interfaces().find(|i| i.number() == number)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = InterfaceRef<'_>> + '_ {
        (0..self.interfaces.len()).filter_map(|i| self.interface(i))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.raw.clone()
    }
}

/// All alternate settings of one interface, borrowed from its configuration.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceRef<'a> {
    number: u8,
    data: &'a [u8],
}

impl<'a> InterfaceRef<'a> {
    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    fn walk(self) -> impl Iterator<Item = super::RawDescriptor<'a>> + 'a {
        super::descriptors(self.data)
    }

    /// Offset of each alternate setting's interface descriptor.
    fn alternates(self) -> impl Iterator<Item = (usize, InterfaceDescriptor)> + 'a {
        let number = self.number;
        self.walk().filter_map(move |d| {
            if d.header.descriptor_type != DescriptorType::INTERFACE {
                return None;
            }
            let intf = InterfaceDescriptor::parse(d.data)?;
            (intf.interface_number == number).then_some((d.offset, intf))
        })
    }

    pub fn num_alternates(&self) -> usize {
        self.alternates().count()
    }

    /// Descriptor of the alternate setting with `bAlternateSetting == alt`.
    pub fn descriptor(&self, alt: u8) -> Option<InterfaceDescriptor> {
        self.alternates()
            .map(|(_, d)| d)
            .find(|d| d.alternate_setting == alt)
    }

    pub fn class(&self) -> BaseClass {
        self.descriptor(0)
            .map(|d| d.class())
            .unwrap_or(BaseClass::Other(0))
    }

    /// Bytes from the alternate setting's interface descriptor (exclusive) to
    /// the next interface descriptor.
    fn alternate_body(self, alt: u8) -> Option<&'a [u8]> {
        let data = self.data;
        let (start, desc) = self
            .alternates()
            .find(|(_, d)| d.alternate_setting == alt)?;
        let body_start = start + desc.length as usize;
        let mut offset = body_start;
        let mut end = data.len();
        while offset < data.len() {
            let at = offset;
            let Ok(d) = next_descriptor(data, &mut offset) else {
                end = at;
                break;
            };
            if d.header.descriptor_type == DescriptorType::INTERFACE {
                end = at;
                break;
            }
        }
        data.get(body_start..end)
    }

    pub fn endpoints(self, alt: u8) -> impl Iterator<Item = EndpointDescriptor> + 'a {
        self.alternate_body(alt)
            .into_iter()
            .flat_map(super::descriptors)
            .filter(|d| d.header.descriptor_type == DescriptorType::ENDPOINT)
            .filter_map(|d| EndpointDescriptor::parse(d.data))
    }

    pub fn num_endpoints(&self, alt: u8) -> usize {
        self.endpoints(alt).count()
    }

    pub fn endpoint(&self, alt: u8, index: usize) -> Option<EndpointDescriptor> {
        self.endpoints(alt).nth(index)
    }

    /// Class specific descriptors between the alternate setting's interface
    /// descriptor and its first endpoint.
    pub fn extra(&self, alt: u8) -> Option<&'a [u8]> {
        let body = self.alternate_body(alt)?;
        let mut offset = 0;
        while offset < body.len() {
            let at = offset;
            let d = next_descriptor(body, &mut offset).ok()?;
            if d.header.descriptor_type == DescriptorType::ENDPOINT {
                return Some(&body[..at]);
            }
        }
        Some(body)
    }
}
