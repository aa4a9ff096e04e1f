use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;
use usbh_if::transfer::{Direction, EndpointType, SetupPacket, Speed, Token};

use crate::{err::*, host::HostController, urb::UrbHandle};

/// Operation table of a host controller driver.
///
/// All calls for one controller are serialized by the core and run in task
/// context. `urb_submit` must not block; the driver reports the hardware
/// completion later through [`UrbHandle::done`], which is the only call it
/// may make from interrupt context. Results and IN data are written back in
/// `urb_complete`.
pub trait HcdOp: Send + 'static {
    /// Brings the controller to a state where `start` can run.
    fn init(&mut self) -> Result;

    fn start(&mut self) -> Result;

    fn stop(&mut self) -> Result;

    fn suspend(&mut self) -> Result;

    fn resume(&mut self) -> Result;

    /// Speed of the root hub.
    fn speed(&self) -> Speed;

    fn frame_number(&self) -> u32;

    fn ep_open(&mut self, ep: &EndpointInfo) -> Result;

    fn ep_close(&mut self, ep: &EndpointInfo) -> Result;

    /// Cancels every outstanding transfer on the pipe.
    fn ep_abort(&mut self, ep: &EndpointInfo) -> Result;

    fn ep_halted(&mut self, ep: &EndpointInfo) -> bool;

    fn urb_submit(&mut self, urb: &UrbHandle) -> Result;

    /// Post-processing of a descriptor the driver marked done.
    fn urb_complete(&mut self, urb: &UrbHandle) -> Result;

    /// Releases hardware resources of a descriptor that will not complete.
    fn urb_abort(&mut self, urb: &UrbHandle) -> Result;

    /// `true` when the root hub is emulated in software by the driver.
    fn virtual_root_hub(&self) -> bool {
        false
    }

    /// Executes one standard or hub class request on a virtual root hub.
    /// Returns the number of DATA stage bytes produced or consumed.
    fn root_hub_request(&mut self, setup: &SetupPacket, data: &mut [u8]) -> Result<usize> {
        let _ = (setup, data);
        Err(USBError::NotFound)
    }
}

/// Everything a host controller driver needs to know about a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub device_address: u8,
    pub speed: Speed,
    /// Root hub port the device hangs off.
    pub port: u8,
    /// A high speed hub translates for this full or low speed device.
    pub tt: bool,
    pub number: u8,
    /// `None` for control pipes.
    pub direction: Option<Direction>,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    /// Polling interval in frames (full/low speed) or micro-frames.
    pub interval: u32,
}

impl EndpointInfo {
    /// `bEndpointAddress` with the direction bit.
    pub fn address(&self) -> u8 {
        self.number | self.direction.map(Direction::to_address_bit).unwrap_or(0)
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev {} ep {:#04x} {:?}",
            self.device_address,
            self.address(),
            self.transfer_type
        )
    }
}

/// Route from a device's pipes to the hardware.
pub(crate) trait DevicePath: Send + Sync {
    fn ep_open(&self, ep: &EndpointInfo) -> Result;
    fn ep_close(&self, ep: &EndpointInfo) -> Result;
    fn ep_abort(&self, ep: &EndpointInfo) -> Result;
    fn ep_halted(&self, ep: &EndpointInfo) -> bool;
    fn urb_submit(&self, urb: &UrbHandle) -> Result;
    fn urb_complete(&self, urb: &UrbHandle) -> Result;
    fn urb_abort(&self, urb: &UrbHandle) -> Result;
}

pub(crate) fn device_path(hc: &Arc<HostController>, root_hub: bool) -> Arc<dyn DevicePath> {
    if root_hub && hc.virtual_root_hub() {
        Arc::new(RootHubPath::new(hc.clone()))
    } else {
        Arc::new(HcdPath { hc: hc.clone() })
    }
}

/// Devices reached through the controller hardware.
pub(crate) struct HcdPath {
    hc: Arc<HostController>,
}

impl DevicePath for HcdPath {
    fn ep_open(&self, ep: &EndpointInfo) -> Result {
        self.hc.with_hcd(|h| h.ep_open(ep))
    }

    fn ep_close(&self, ep: &EndpointInfo) -> Result {
        self.hc.with_hcd(|h| h.ep_close(ep))
    }

    fn ep_abort(&self, ep: &EndpointInfo) -> Result {
        self.hc.with_hcd(|h| h.ep_abort(ep))
    }

    fn ep_halted(&self, ep: &EndpointInfo) -> bool {
        self.hc.with_hcd(|h| h.ep_halted(ep))
    }

    fn urb_submit(&self, urb: &UrbHandle) -> Result {
        self.hc.with_hcd(|h| h.urb_submit(urb))
    }

    fn urb_complete(&self, urb: &UrbHandle) -> Result {
        self.hc.with_hcd(|h| h.urb_complete(urb))
    }

    fn urb_abort(&self, urb: &UrbHandle) -> Result {
        self.hc.with_hcd(|h| h.urb_abort(urb))
    }
}

/// The software root hub of a controller. Pipes need no hardware setup and
/// control transfers are answered by [`HcdOp::root_hub_request`] as soon as
/// they are submitted.
pub(crate) struct RootHubPath {
    hc: Arc<HostController>,
    pending: Mutex<Option<PendingRequest>>,
}

struct PendingRequest {
    setup: SetupPacket,
    executed: bool,
}

impl RootHubPath {
    fn new(hc: Arc<HostController>) -> Self {
        Self {
            hc,
            pending: Mutex::new(None),
        }
    }

    fn execute(&self, setup: &SetupPacket, data: &mut [u8]) -> Result<usize> {
        self.hc.with_hcd(|h| h.root_hub_request(setup, data))
    }

    fn stage(&self, urb: &UrbHandle) -> Result<usize> {
        let mut pending = self.pending.lock();
        match urb.token() {
            Token::Setup => {
                let setup = urb
                    .with_buffer(|b| SetupPacket::parse(b))
                    .ok_or(USBError::InvalidArgument)?;
                *pending = Some(PendingRequest {
                    setup,
                    executed: false,
                });
                Ok(SetupPacket::LEN)
            }
            Token::In | Token::Out => {
                let req = pending.as_mut().ok_or(USBError::InvalidArgument)?;
                if !req.executed && req.setup.length > 0 && !urb.is_empty() {
                    req.executed = true;
                    let mut data = urb.with_buffer(|b| b.to_vec());
                    let n = self.execute(&req.setup, &mut data)?;
                    urb.with_buffer(|b| b.copy_from_slice(&data));
                    Ok(n)
                } else {
                    if !req.executed {
                        self.execute(&req.setup, &mut [])?;
                    }
                    *pending = None;
                    Ok(0)
                }
            }
        }
    }
}

impl DevicePath for RootHubPath {
    fn ep_open(&self, _ep: &EndpointInfo) -> Result {
        Ok(())
    }

    fn ep_close(&self, _ep: &EndpointInfo) -> Result {
        Ok(())
    }

    fn ep_abort(&self, _ep: &EndpointInfo) -> Result {
        *self.pending.lock() = None;
        Ok(())
    }

    fn ep_halted(&self, _ep: &EndpointInfo) -> bool {
        false
    }

    fn urb_submit(&self, urb: &UrbHandle) -> Result {
        let control = urb
            .endpoint()
            .is_some_and(|ep| ep.transfer_type == EndpointType::Control);
        if !control {
            return Err(USBError::InvalidArgument);
        }
        let result = self.stage(urb).map_err(|e| match e {
            USBError::TransferError(t) => t,
            _ => usbh_if::err::TransferError::Stall,
        });
        urb.set_result(result);
        urb.done();
        Ok(())
    }

    fn urb_complete(&self, _urb: &UrbHandle) -> Result {
        Ok(())
    }

    fn urb_abort(&self, _urb: &UrbHandle) -> Result {
        Ok(())
    }
}
