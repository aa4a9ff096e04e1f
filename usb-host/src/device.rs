use alloc::{
    collections::btree_map::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use core::time::Duration;

use spin::Mutex;
use usbh_if::{
    descriptor::{
        Configuration, DescriptorType, DeviceDescriptor, EndpointDescriptor, InterfaceRef,
        LANGID_EN_US, STRING_INDEX_LANGID, decode_string_descriptor,
    },
    transfer::{
        ControlSetup, Direction, EndpointType, FEATURE_ENDPOINT_HALT, Recipient, Request,
        RequestType, SetupPacket, Speed,
    },
};

use crate::{
    HcId,
    backend::{DevicePath, EndpointInfo},
    ep::*,
    err::*,
};

/// Where a newly attached device was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttach {
    pub speed: Speed,
    pub port: u8,
    /// A high speed hub sits between a full or low speed device and the
    /// controller.
    pub tt: bool,
}

impl DeviceAttach {
    pub fn new(speed: Speed, port: u8) -> Self {
        Self {
            speed,
            port,
            tt: false,
        }
    }
}

pub(crate) fn default_endpoint_info(attach: DeviceAttach, address: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        device_address: address,
        speed: attach.speed,
        port: attach.port,
        tt: attach.tt,
        number: 0,
        direction: None,
        transfer_type: EndpointType::Control,
        max_packet_size,
        interval: 0,
    }
}

/// Number of attempts for standard requests issued by the core.
pub(crate) const STD_REQ_RETRIES: usize = 3;

/// Default pipe and addressing state shared by enumeration and [`Device`].
pub(crate) struct DeviceLink {
    pub hc_id: HcId,
    pub path: Arc<dyn DevicePath>,
    pub ctx: Arc<TransferContext>,
    pub attach: DeviceAttach,
    pub is_root_hub: bool,
    pub ctrl: EndpointControl,
}

impl DeviceLink {
    pub fn timeout(&self) -> Duration {
        self.ctx.std_req_timeout
    }

    pub fn control(&self, direction: Direction, setup: ControlSetup, data: SyncBuf<'_>) -> Result<usize> {
        let len = match &data {
            SyncBuf::In(b) => b.len(),
            SyncBuf::Out(b) => b.len(),
        };
        let len = u16::try_from(len).map_err(|_| USBError::InvalidArgument)?;
        let packet = SetupPacket::new(direction, &setup, len);
        self.ctrl.request(packet, data, self.timeout())
    }

    pub fn get_descriptor(
        &self,
        ty: DescriptorType,
        index: u8,
        lang_id: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.control(
            Direction::In,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::GetDescriptor,
                value: ((ty.0 as u16) << 8) | index as u16,
                index: lang_id,
            },
            SyncBuf::In(buf),
        )
    }

    /// Abort, close and reopen of the default pipe.
    pub fn reset_default_endpoint(&self) -> Result {
        self.ctrl.reset()
    }

    /// Runs `f` up to [`STD_REQ_RETRIES`] times, resetting the default pipe
    /// and backing off between attempts.
    pub fn retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < STD_REQ_RETRIES => {
                    warn!("{what}: attempt {attempt} failed: {e}");
                    if let Err(e) = self.reset_default_endpoint() {
                        warn!("{what}: default endpoint reset failed: {e}");
                    }
                    self.ctx.kernel.delay(Duration::from_millis(100));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// First language ID listed in string descriptor 0.
    pub fn language(&self, max_len: usize) -> Result<u16> {
        let raw = self.read_string(STRING_INDEX_LANGID, 0, max_len)?;
        if raw.len() >= 4 {
            Ok(u16::from_le_bytes([raw[2], raw[3]]))
        } else {
            Ok(LANGID_EN_US)
        }
    }

    pub fn read_string(&self, index: u8, lang_id: u16, max_len: usize) -> Result<Vec<u8>> {
        let header_len = if index == STRING_INDEX_LANGID { 4 } else { 2 };
        let mut header = [0u8; 4];
        let n = self.retry("string header", || {
            self.get_descriptor(
                DescriptorType::STRING,
                index,
                lang_id,
                &mut header[..header_len],
            )
        })?;
        if n != header_len || header[0] == 0 || header[1] != DescriptorType::STRING.0 {
            return Err(USBError::InvalidDescriptor);
        }
        if index == STRING_INDEX_LANGID {
            return Ok(header[..n].to_vec());
        }

        let len = (header[0] as usize).min(max_len);
        let mut buf = vec![0u8; len];
        let n = self.retry("string", || {
            self.get_descriptor(DescriptorType::STRING, index, lang_id, &mut buf)
        })?;
        if n == 0 {
            return Err(USBError::InvalidDescriptor);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

#[derive(Debug, Default)]
struct Selection {
    /// Index into the device's configurations.
    config: Option<usize>,
    alternates: BTreeMap<u8, u8>,
}

/// An enumerated USB device.
pub struct Device {
    pub(crate) link: DeviceLink,
    pub(crate) address: u8,
    pub(crate) descriptor: DeviceDescriptor,
    pub(crate) configurations: Vec<Configuration>,
    pub(crate) max_endpoints: usize,
    pub(crate) max_string_len: usize,
    selection: Mutex<Selection>,
    lang_id: Mutex<Option<u16>>,
    endpoints: Mutex<Vec<Weak<EndpointShared>>>,
}

impl Device {
    pub(crate) fn new(
        link: DeviceLink,
        address: u8,
        descriptor: DeviceDescriptor,
        configurations: Vec<Configuration>,
        max_endpoints: usize,
        max_string_len: usize,
    ) -> Self {
        Self {
            link,
            address,
            descriptor,
            configurations,
            max_endpoints,
            max_string_len,
            selection: Mutex::new(Selection::default()),
            lang_id: Mutex::new(None),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.link.attach.speed
    }

    pub fn port(&self) -> u8 {
        self.link.attach.port
    }

    pub fn is_root_hub(&self) -> bool {
        self.link.is_root_hub
    }

    pub fn host_controller(&self) -> HcId {
        self.link.hc_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn configuration(&self, index: usize) -> Option<&Configuration> {
        self.configurations.get(index)
    }

    /// The configuration selected with [`Device::set_configuration`].
    pub fn active_configuration(&self) -> Option<&Configuration> {
        let ix = self.selection.lock().config?;
        self.configurations.get(ix)
    }

    /// Alternate setting currently selected on `interface`.
    pub fn alternate_setting(&self, interface: u8) -> u8 {
        self.selection
            .lock()
            .alternates
            .get(&interface)
            .copied()
            .unwrap_or(0)
    }

    pub fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize> {
        self.link.control(Direction::In, setup, SyncBuf::In(buf))
    }

    pub fn control_out(&self, setup: ControlSetup, buf: &[u8]) -> Result<usize> {
        self.link.control(Direction::Out, setup, SyncBuf::Out(buf))
    }

    pub fn get_descriptor(
        &self,
        ty: DescriptorType,
        index: u8,
        lang_id: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.link.get_descriptor(ty, index, lang_id, buf)
    }

    /// Selects the configuration with `bConfigurationValue == value`. All
    /// interfaces fall back to alternate setting 0.
    pub fn set_configuration(&self, value: u8) -> Result {
        let ix = self
            .configurations
            .iter()
            .position(|c| c.configuration_value() == value)
            .ok_or(USBError::NotFound)?;
        self.control_out(
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::SetConfiguration,
                value: value as u16,
                index: 0,
            },
            &[],
        )?;
        let mut sel = self.selection.lock();
        sel.config = Some(ix);
        sel.alternates.clear();
        debug!("dev {}: configuration {value} selected", self.address);
        Ok(())
    }

    /// Asks the device for its current `bConfigurationValue`.
    pub fn get_configuration(&self) -> Result<u8> {
        let mut value = [0u8; 1];
        self.control_in(
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::GetConfiguration,
                value: 0,
                index: 0,
            },
            &mut value,
        )?;
        Ok(value[0])
    }

    pub fn set_interface(&self, interface: u8, alternate: u8) -> Result {
        let config = self
            .active_configuration()
            .ok_or(USBError::ConfigurationNotSet)?;
        let intf = config
            .interface_by_number(interface)
            .ok_or(USBError::NotFound)?;
        if intf.descriptor(alternate).is_none() {
            return Err(USBError::NotFound);
        }
        self.control_out(
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Interface,
                request: Request::SetInterface,
                value: alternate as u16,
                index: interface as u16,
            },
            &[],
        )?;
        self.selection.lock().alternates.insert(interface, alternate);
        Ok(())
    }

    /// Interface of the active configuration.
    pub fn interface(&self, number: u8) -> Result<InterfaceRef<'_>> {
        self.active_configuration()
            .ok_or(USBError::ConfigurationNotSet)?
            .interface_by_number(number)
            .ok_or(USBError::NotFound)
    }

    fn language(&self) -> Result<u16> {
        if let Some(id) = *self.lang_id.lock() {
            return Ok(id);
        }
        let id = self.link.language(self.max_string_len)?;
        self.cache_language(id);
        Ok(id)
    }

    pub(crate) fn cache_language(&self, id: u16) {
        *self.lang_id.lock() = Some(id);
    }

    /// Reads and decodes string descriptor `index` in the device's first
    /// language.
    pub fn string_descriptor(&self, index: u8) -> Result<String> {
        if index == STRING_INDEX_LANGID {
            return Err(USBError::InvalidArgument);
        }
        let lang_id = self.language()?;
        let raw = self.link.read_string(index, lang_id, self.max_string_len)?;
        decode_string_descriptor(&raw)
    }

    /// Opens the first endpoint of `(ty, direction)` in the selected
    /// alternate setting of `interface`. `direction` is ignored for control
    /// endpoints.
    ///
    /// If that pipe is already open the returned handle shares it, and
    /// closing either handle closes both.
    pub fn open_endpoint(&self, interface: u8, ty: EndpointType, direction: Direction) -> Result<Endpoint> {
        let alt = self.alternate_setting(interface);
        let intf = self.interface(interface)?;
        if intf.num_endpoints(alt) > self.max_endpoints {
            return Err(USBError::Busy);
        }
        let desc = intf
            .endpoints(alt)
            .find(|d| {
                d.transfer_type() == ty
                    && (ty == EndpointType::Control || d.direction() == Some(direction))
            })
            .ok_or(USBError::EndpointNotFound)?;

        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|ep| ep.strong_count() > 0);
        if let Some(raw) = endpoints
            .iter()
            .filter_map(Weak::upgrade)
            .find(|ep| ep.is_open() && ep.info.address() == desc.address)
        {
            trace!("{}: already open", raw.info);
            return Ok(Endpoint::new(raw));
        }

        let info = EndpointInfo {
            device_address: self.address,
            speed: self.speed(),
            port: self.port(),
            tt: self.link.attach.tt,
            number: desc.number(),
            direction: desc.direction(),
            transfer_type: ty,
            max_packet_size: desc.max_packet_size(),
            interval: polling_interval(&desc, self.speed(), self.link.attach.tt),
        };
        let raw = EndpointShared::open(info, self.link.path.clone(), self.link.ctx.clone())?;
        endpoints.push(Arc::downgrade(&raw));
        Ok(Endpoint::new(raw))
    }

    pub fn open_bulk_in(&self, interface: u8) -> Result<EndpointBulkIn> {
        self.open_endpoint(interface, EndpointType::Bulk, Direction::In)?
            .try_into()
    }

    pub fn open_bulk_out(&self, interface: u8) -> Result<EndpointBulkOut> {
        self.open_endpoint(interface, EndpointType::Bulk, Direction::Out)?
            .try_into()
    }

    pub fn open_interrupt_in(&self, interface: u8) -> Result<EndpointInterruptIn> {
        self.open_endpoint(interface, EndpointType::Interrupt, Direction::In)?
            .try_into()
    }

    pub fn open_interrupt_out(&self, interface: u8) -> Result<EndpointInterruptOut> {
        self.open_endpoint(interface, EndpointType::Interrupt, Direction::Out)?
            .try_into()
    }

    pub fn open_iso_in(&self, interface: u8) -> Result<EndpointIsoIn> {
        self.open_endpoint(interface, EndpointType::Isochronous, Direction::In)?
            .try_into()
    }

    pub fn open_iso_out(&self, interface: u8) -> Result<EndpointIsoOut> {
        self.open_endpoint(interface, EndpointType::Isochronous, Direction::Out)?
            .try_into()
    }

    fn endpoint_feature(&self, request: Request, ep: &Endpoint) -> Result {
        let res = self.control_out(
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Endpoint,
                request,
                value: FEATURE_ENDPOINT_HALT,
                index: ep.info().address() as u16,
            },
            &[],
        );
        if let Err(e) = &res {
            warn!("{}: {request:?} ENDPOINT_HALT failed: {e}", ep.info());
            if let Err(e) = self.link.reset_default_endpoint() {
                warn!("dev {}: default endpoint reset failed: {e}", self.address);
            }
        }
        res.map(|_| ())
    }

    /// Sends SET_FEATURE(ENDPOINT_HALT) to `ep`.
    pub fn set_halt(&self, ep: &Endpoint) -> Result {
        self.endpoint_feature(Request::SetFeature, ep)
    }

    /// Sends CLEAR_FEATURE(ENDPOINT_HALT) to `ep`.
    pub fn clear_halt(&self, ep: &Endpoint) -> Result {
        self.endpoint_feature(Request::ClearFeature, ep)
    }

    pub fn reset_endpoint(&self, ep: &Endpoint) -> Result {
        ep.reset()
    }

    pub fn reset_default_endpoint(&self) -> Result {
        self.link.reset_default_endpoint()
    }

    /// Closes every pipe of the device, the default one last.
    pub(crate) fn detach(&self) {
        let endpoints: Vec<_> = self
            .endpoints
            .lock()
            .drain(..)
            .filter_map(|ep| ep.upgrade())
            .collect();
        for ep in endpoints {
            if let Err(e) = ep.close() {
                warn!("{}: close on detach failed: {e}", ep.info);
            }
        }
        if let Err(e) = self.link.ctrl.close() {
            warn!("dev {}: closing default endpoint failed: {e}", self.address);
        }
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("speed", &self.speed())
            .field("vendor_id", &self.descriptor.vendor_id)
            .field("product_id", &self.descriptor.product_id)
            .finish()
    }
}

/// Polling interval for an endpoint, in frames for full and low speed
/// devices without a transaction translator and in micro-frames otherwise.
pub(crate) fn polling_interval(desc: &EndpointDescriptor, speed: Speed, tt: bool) -> u32 {
    let b = desc.interval as u32;
    if b == 0 {
        return 0;
    }
    let exp = 1u32 << (b.min(16) - 1);
    match desc.transfer_type() {
        EndpointType::Interrupt => match speed {
            Speed::Low | Speed::Full if tt => b * 8,
            Speed::Low | Speed::Full => b,
            _ => exp,
        },
        EndpointType::Isochronous => exp,
        _ => 0,
    }
}
