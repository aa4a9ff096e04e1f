//! Bringing a freshly attached device from the default address to a parsed
//! descriptor tree.

use alloc::{string::String, sync::Arc, vec, vec::Vec};
use core::time::Duration;

use usbh_if::{
    descriptor::{
        Configuration, ConfigurationDescriptor, DescriptorType, DeviceDescriptor,
        decode_string_descriptor, parse_configuration,
    },
    transfer::{ControlSetup, Direction, Recipient, Request, RequestType},
};

use crate::{
    HcId,
    backend::device_path,
    config::HostConfig,
    device::{Device, DeviceAttach, DeviceLink, default_endpoint_info},
    ep::{EndpointControl, EndpointShared, SyncBuf, TransferContext},
    err::*,
    host::HostController,
};

/// Recovery time the device is granted after SET_ADDRESS.
const SET_ADDRESS_RECOVERY: Duration = Duration::from_millis(2);

pub(crate) struct EnumerateRequest<'a> {
    pub hc: &'a Arc<HostController>,
    pub hc_id: HcId,
    pub ctx: &'a Arc<TransferContext>,
    pub config: &'a HostConfig,
    pub attach: DeviceAttach,
    pub is_root_hub: bool,
    /// Address the device will be moved to.
    pub address: u8,
}

struct Enumerated {
    descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
    lang_id: Option<u16>,
}

pub(crate) fn enumerate(req: EnumerateRequest<'_>) -> Result<Device> {
    let path = device_path(req.hc, req.is_root_hub);
    let mps = req.attach.speed.default_max_packet_size();

    let link = DeviceLink {
        hc_id: req.hc_id,
        path: path.clone(),
        ctx: req.ctx.clone(),
        attach: req.attach,
        is_root_hub: req.is_root_hub,
        ctrl: EndpointControl::new(EndpointShared::open(
            default_endpoint_info(req.attach, 0, mps),
            path,
            req.ctx.clone(),
        )?),
    };
    debug!(
        "port {}: enumerating {:?} speed device",
        req.attach.port, req.attach.speed
    );

    match run(&link, &req) {
        Ok(found) => {
            let device = Device::new(
                link,
                req.address,
                found.descriptor,
                found.configurations,
                req.config.max_endpoints,
                req.config.max_string_len,
            );
            if let Some(id) = found.lang_id {
                device.cache_language(id);
            }
            Ok(device)
        }
        Err(e) => {
            error!("port {}: enumeration failed: {e}", req.attach.port);
            if let Err(e) = link.ctrl.close() {
                warn!("port {}: closing default endpoint failed: {e}", req.attach.port);
            }
            Err(e)
        }
    }
}

/// Closes the default pipe and opens it again with new parameters.
fn reopen_default(link: &DeviceLink, address: u8, max_packet_size: u16) -> Result {
    let old = link.ctrl.pipe();
    old.close()?;
    let info = default_endpoint_info(link.attach, address, max_packet_size);
    let new = EndpointShared::open(info, link.path.clone(), link.ctx.clone())?;
    link.ctrl.replace(new);
    Ok(())
}

fn run(link: &DeviceLink, req: &EnumerateRequest<'_>) -> Result<Enumerated> {
    let descriptor = read_device_descriptor(link, req)?;
    set_address(link, req.address, descriptor.max_packet_size_0 as u16)?;
    debug!("port {}: device address {}", req.attach.port, req.address);

    let lang_id = log_strings(link, &descriptor, req.config.max_string_len);

    let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
    for index in 0..descriptor.num_configurations {
        configurations.push(read_configuration(link, index, req.config)?);
    }
    Ok(Enumerated {
        descriptor,
        configurations,
        lang_id,
    })
}

fn read_device_descriptor(link: &DeviceLink, req: &EnumerateRequest<'_>) -> Result<DeviceDescriptor> {
    let mut head = [0u8; DeviceDescriptor::LEN_MIN];
    let n = link.retry("device descriptor header", || {
        link.get_descriptor(DescriptorType::DEVICE, 0, 0, &mut head)
    })?;
    if n < DeviceDescriptor::LEN_MIN {
        return Err(USBError::InvalidDescriptor);
    }

    let mps = head[7] as u16;
    if mps == 0 || mps > 64 {
        debug!("port {}: bad bMaxPacketSize0 {mps}", req.attach.port);
        return Err(USBError::InvalidDescriptor);
    }
    reopen_default(link, 0, mps)?;

    let mut raw = [0u8; DeviceDescriptor::LEN];
    let n = link.retry("device descriptor", || {
        link.get_descriptor(DescriptorType::DEVICE, 0, 0, &mut raw)
    })?;
    if n < DeviceDescriptor::LEN || (raw[0] as usize) < DeviceDescriptor::LEN {
        return Err(USBError::InvalidDescriptor);
    }
    let desc = DeviceDescriptor::parse(&raw).ok_or(USBError::InvalidDescriptor)?;

    let num_cfgs = desc.num_configurations as usize;
    if num_cfgs == 0 || num_cfgs > req.config.max_configurations {
        debug!("port {}: {num_cfgs} configurations", req.attach.port);
        return Err(USBError::InvalidDescriptor);
    }
    if !desc.class().supported_by_device() {
        debug!("port {}: device class {:#04x} not supported", req.attach.port, desc.class);
        return Err(USBError::InvalidDescriptor);
    }
    Ok(desc)
}

fn set_address(link: &DeviceLink, address: u8, max_packet_size: u16) -> Result {
    link.retry("SET_ADDRESS", || {
        link.control(
            Direction::Out,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::SetAddress,
                value: address as u16,
                index: 0,
            },
            SyncBuf::Out(&[]),
        )
    })?;
    reopen_default(link, address, max_packet_size)?;
    link.ctx.kernel.delay(SET_ADDRESS_RECOVERY);
    Ok(())
}

fn read_configuration(link: &DeviceLink, index: u8, config: &HostConfig) -> Result<Configuration> {
    let mut head = [0u8; ConfigurationDescriptor::LEN];
    let n = link.retry("configuration header", || {
        link.get_descriptor(DescriptorType::CONFIGURATION, index, 0, &mut head)
    })?;
    if n < ConfigurationDescriptor::LEN || head[1] != DescriptorType::CONFIGURATION.0 {
        return Err(USBError::InvalidDescriptor);
    }

    let total = u16::from_le_bytes([head[2], head[3]]) as usize;
    if total > config.max_config_data_len {
        error!(
            "configuration {index}: wTotalLength {total} exceeds {}",
            config.max_config_data_len
        );
        return Err(USBError::NoMemory);
    }

    let mut raw = vec![0u8; total];
    let n = link.retry("configuration", || {
        link.get_descriptor(DescriptorType::CONFIGURATION, index, 0, &mut raw)
    })?;
    if n < total || raw.get(1) != Some(&DescriptorType::CONFIGURATION.0) {
        return Err(USBError::InvalidDescriptor);
    }
    parse_configuration(raw, config.parse_limits())
}

/// Logs the manufacturer and product strings. Failures only cost the log
/// line. Returns the language ID if it could be read.
fn log_strings(link: &DeviceLink, desc: &DeviceDescriptor, max_len: usize) -> Option<u16> {
    if desc.manufacturer_string_index.is_none() && desc.product_string_index.is_none() {
        return None;
    }
    let lang_id = match link.language(max_len) {
        Ok(id) => id,
        Err(e) => {
            debug!("language ID unavailable: {e}");
            return None;
        }
    };
    let read = |index: u8| -> Result<String> {
        decode_string_descriptor(&link.read_string(index, lang_id, max_len)?)
    };
    if let Some(ix) = desc.manufacturer_string_index {
        match read(ix.get()) {
            Ok(s) => info!("Manufacturer: {s}"),
            Err(e) => debug!("manufacturer string: {e}"),
        }
    }
    if let Some(ix) = desc.product_string_index {
        match read(ix.get()) {
            Ok(s) => info!("Product: {s}"),
            Err(e) => debug!("product string: {e}"),
        }
    }
    Some(lang_id)
}
