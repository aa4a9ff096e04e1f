#![allow(dead_code)]

//! A scripted host controller that plays one USB device.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use usbh::*;

pub struct StdKernel;

impl KernelOp for StdKernel {
    fn now(&self) -> Duration {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed()
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

pub static KERNEL: StdKernel = StdKernel;

pub const VID: u16 = 0x1234;
pub const PID: u16 = 0x5678;

pub const EP_BULK_IN: [u8; 7] = [7, 5, 0x81, 0x02, 64, 0, 0];
pub const EP_BULK_OUT: [u8; 7] = [7, 5, 0x02, 0x02, 64, 0, 0];
pub const EP_INT_IN: [u8; 7] = [7, 5, 0x83, 0x03, 8, 0, 10];
pub const EP_ISO_IN: [u8; 7] = [7, 5, 0x84, 0x01, 192, 0, 1];

pub fn init_log() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}

pub fn device_descriptor(max_packet_size_0: u8) -> Vec<u8> {
    let vid = VID.to_le_bytes();
    let pid = PID.to_le_bytes();
    vec![
        18, 1, 0x00, 0x02, 0, 0, 0, max_packet_size_0, vid[0], vid[1], pid[0], pid[1], 0x00,
        0x01, 1, 2, 0, 1,
    ]
}

/// One configuration (value 1) with a single vendor specific interface.
pub fn config_descriptor(endpoints: &[[u8; 7]]) -> Vec<u8> {
    let mut raw = vec![9, 2, 0, 0, 1, 1, 0, 0x80, 50];
    raw.extend_from_slice(&[9, 4, 0, 0, endpoints.len() as u8, 0xFF, 0, 0, 0]);
    for ep in endpoints {
        raw.extend_from_slice(ep);
    }
    let total = (raw.len() as u16).to_le_bytes();
    raw[2] = total[0];
    raw[3] = total[1];
    raw
}

pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut raw = vec![0, 3];
    for unit in s.encode_utf16() {
        raw.extend_from_slice(&unit.to_le_bytes());
    }
    raw[0] = raw.len() as u8;
    raw
}

#[derive(Debug, Clone)]
pub struct DeviceModel {
    pub device: Vec<u8>,
    pub configs: Vec<Vec<u8>>,
    pub strings: HashMap<u8, Vec<u8>>,
}

impl DeviceModel {
    pub fn new(speed: Speed) -> Self {
        let mps = speed.default_max_packet_size() as u8;
        let mut strings = HashMap::new();
        strings.insert(0, vec![4, 3, 0x09, 0x04]);
        strings.insert(1, string_descriptor("Crab"));
        strings.insert(2, string_descriptor("Mock"));
        Self {
            device: device_descriptor(mps),
            configs: vec![config_descriptor(&[
                EP_BULK_IN,
                EP_BULK_OUT,
                EP_INT_IN,
                EP_ISO_IN,
            ])],
            strings,
        }
    }

    fn descriptor(&self, setup: &SetupPacket) -> Option<Vec<u8>> {
        let index = (setup.value & 0xFF) as u8;
        match (setup.value >> 8) as u8 {
            0x01 => Some(self.device.clone()),
            0x02 => self.configs.get(index as usize).cloned(),
            0x03 => self.strings.get(&index).cloned(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Start,
    Stop,
    Suspend,
    Resume,
    EpOpen { dev: u8, ep: u8, mps: u16 },
    EpClose { dev: u8, ep: u8 },
    EpAbort { dev: u8, ep: u8 },
    Setup { dev: u8, packet: SetupPacket },
    Submit { dev: u8, ep: u8, token: Token, len: usize },
    Complete { dev: u8, ep: u8 },
    Abort { dev: u8, ep: u8 },
    RootHub(SetupPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Data endpoints complete from `urb_submit`.
    Inline,
    /// Data endpoints wait for [`MockShared::complete_all`].
    Deferred,
}

#[derive(Default)]
struct DeviceState {
    setup: HashMap<u8, SetupPacket>,
    configuration: u8,
}

pub struct MockShared {
    pub model: Mutex<DeviceModel>,
    calls: Mutex<Vec<Call>>,
    pending: Mutex<Vec<UrbHandle>>,
    /// Deferred transfers the interrupt side has signalled; their data moves
    /// in `urb_complete`.
    signalled: Mutex<Vec<UrbHandle>>,
    state: Mutex<DeviceState>,
    mode: Mutex<Mode>,
    pub halted: AtomicBool,
    /// SETUP stages still to fail with a stall.
    pub fail_setups: AtomicUsize,
    /// Data transfers still to fail with a stall.
    pub fail_transfers: AtomicUsize,
    seq: AtomicUsize,
}

impl MockShared {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        core::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Signals every deferred transfer, the way an interrupt handler would:
    /// only [`UrbHandle::done`] is called here.
    pub fn complete_all(&self) -> usize {
        let pending = core::mem::take(&mut *self.pending.lock().unwrap());
        let n = pending.len();
        for urb in pending {
            self.signalled.lock().unwrap().push(urb.clone());
            urb.done();
        }
        n
    }

    /// Runs a signalled deferred transfer from `urb_complete`.
    fn write_back(&self, urb: &UrbHandle) {
        let signalled = {
            let mut list = self.signalled.lock().unwrap();
            let before = list.len();
            list.retain(|u| u != urb);
            list.len() != before
        };
        if signalled {
            let result = self.execute(urb);
            urb.set_result(result);
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn finish(&self, urb: &UrbHandle) {
        let result = self.execute(urb);
        urb.set_result(result);
        urb.done();
    }

    fn execute(&self, urb: &UrbHandle) -> std::result::Result<usize, TransferError> {
        let Some(ep) = urb.endpoint() else {
            return Err(TransferError::Other("no endpoint".into()));
        };
        if ep.transfer_type == EndpointType::Control {
            return self.control(ep.device_address, urb);
        }
        if take_one(&self.fail_transfers) {
            return Err(TransferError::Stall);
        }
        let seq = (self.seq.fetch_add(1, Ordering::SeqCst) as u8).wrapping_add(1);
        if let Some(isoc) = urb.isoc() {
            for (i, p) in isoc.packets.iter().enumerate() {
                urb.set_isoc_frame(i, p.length, None);
            }
        }
        if urb.token() == Token::In {
            urb.with_buffer(|b| b.fill(seq));
        }
        Ok(urb.len())
    }

    fn control(&self, dev: u8, urb: &UrbHandle) -> std::result::Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        match urb.token() {
            Token::Setup => {
                let packet = urb
                    .with_buffer(|b| SetupPacket::parse(b))
                    .ok_or(TransferError::DataBuffer)?;
                self.record(Call::Setup { dev, packet });
                if take_one(&self.fail_setups) {
                    return Err(TransferError::Stall);
                }
                state.setup.insert(dev, packet);
                Ok(SetupPacket::LEN)
            }
            token => {
                let packet = *state.setup.get(&dev).ok_or(TransferError::Stall)?;
                if urb.is_empty() {
                    state.setup.remove(&dev);
                    if packet.request == u8::from(Request::SetConfiguration) {
                        state.configuration = packet.value as u8;
                    }
                    return Ok(0);
                }
                if token == Token::Out {
                    return Ok(urb.len());
                }
                let data = match Request::from(packet.request) {
                    Request::GetDescriptor => self
                        .model
                        .lock()
                        .unwrap()
                        .descriptor(&packet)
                        .ok_or(TransferError::Stall)?,
                    Request::GetConfiguration => vec![state.configuration],
                    _ => return Err(TransferError::Stall),
                };
                Ok(urb.with_buffer(|b| {
                    let n = b.len().min(data.len());
                    b[..n].copy_from_slice(&data[..n]);
                    n
                }))
            }
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MockHcd {
    shared: Arc<MockShared>,
    speed: Speed,
    virtual_root_hub: bool,
}

impl MockHcd {
    pub fn new(speed: Speed) -> (Self, Arc<MockShared>) {
        let shared = Arc::new(MockShared {
            model: Mutex::new(DeviceModel::new(speed)),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            signalled: Mutex::new(Vec::new()),
            state: Mutex::new(DeviceState::default()),
            mode: Mutex::new(Mode::Inline),
            halted: AtomicBool::new(false),
            fail_setups: AtomicUsize::new(0),
            fail_transfers: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
        });
        (
            Self {
                shared: shared.clone(),
                speed,
                virtual_root_hub: false,
            },
            shared,
        )
    }

    pub fn with_virtual_root_hub(mut self) -> Self {
        self.virtual_root_hub = true;
        self
    }
}

impl HcdOp for MockHcd {
    fn init(&mut self) -> usbh::Result {
        self.shared.record(Call::Init);
        Ok(())
    }

    fn start(&mut self) -> usbh::Result {
        self.shared.record(Call::Start);
        Ok(())
    }

    fn stop(&mut self) -> usbh::Result {
        self.shared.record(Call::Stop);
        Ok(())
    }

    fn suspend(&mut self) -> usbh::Result {
        self.shared.record(Call::Suspend);
        Ok(())
    }

    fn resume(&mut self) -> usbh::Result {
        self.shared.record(Call::Resume);
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.speed
    }

    fn frame_number(&self) -> u32 {
        42
    }

    fn ep_open(&mut self, ep: &EndpointInfo) -> usbh::Result {
        self.shared.record(Call::EpOpen {
            dev: ep.device_address,
            ep: ep.address(),
            mps: ep.max_packet_size,
        });
        Ok(())
    }

    fn ep_close(&mut self, ep: &EndpointInfo) -> usbh::Result {
        self.shared.record(Call::EpClose {
            dev: ep.device_address,
            ep: ep.address(),
        });
        Ok(())
    }

    fn ep_abort(&mut self, ep: &EndpointInfo) -> usbh::Result {
        self.shared.record(Call::EpAbort {
            dev: ep.device_address,
            ep: ep.address(),
        });
        Ok(())
    }

    fn ep_halted(&mut self, ep: &EndpointInfo) -> bool {
        ep.transfer_type != EndpointType::Control && self.shared.halted.load(Ordering::SeqCst)
    }

    fn urb_submit(&mut self, urb: &UrbHandle) -> usbh::Result {
        let ep = urb.endpoint().ok_or(USBError::InvalidArgument)?;
        self.shared.record(Call::Submit {
            dev: ep.device_address,
            ep: ep.address(),
            token: urb.token(),
            len: urb.len(),
        });
        let deferred = *self.shared.mode.lock().unwrap() == Mode::Deferred;
        if ep.transfer_type != EndpointType::Control && deferred {
            self.shared.pending.lock().unwrap().push(urb.clone());
        } else {
            self.shared.finish(urb);
        }
        Ok(())
    }

    fn urb_complete(&mut self, urb: &UrbHandle) -> usbh::Result {
        if let Some(ep) = urb.endpoint() {
            self.shared.record(Call::Complete {
                dev: ep.device_address,
                ep: ep.address(),
            });
        }
        self.shared.write_back(urb);
        Ok(())
    }

    fn urb_abort(&mut self, urb: &UrbHandle) -> usbh::Result {
        if let Some(ep) = urb.endpoint() {
            self.shared.record(Call::Abort {
                dev: ep.device_address,
                ep: ep.address(),
            });
        }
        self.shared.pending.lock().unwrap().retain(|u| u != urb);
        self.shared.signalled.lock().unwrap().retain(|u| u != urb);
        Ok(())
    }

    fn virtual_root_hub(&self) -> bool {
        self.virtual_root_hub
    }

    fn root_hub_request(&mut self, setup: &SetupPacket, data: &mut [u8]) -> usbh::Result<usize> {
        self.shared.record(Call::RootHub(*setup));
        match Request::from(setup.request) {
            Request::GetDescriptor => {
                let desc = self
                    .shared
                    .model
                    .lock()
                    .unwrap()
                    .descriptor(setup)
                    .ok_or(TransferError::Stall)?;
                let n = data.len().min(desc.len());
                data[..n].copy_from_slice(&desc[..n]);
                Ok(n)
            }
            Request::SetAddress | Request::SetConfiguration => Ok(0),
            _ => Err(TransferError::Stall.into()),
        }
    }
}

pub fn host_with(config: HostConfig, speed: Speed) -> (Host, HcId, Arc<MockShared>) {
    init_log();
    let host = Host::new(&KERNEL, config);
    let (hcd, shared) = MockHcd::new(speed);
    let id = host.hc_add(hcd).unwrap();
    (host, id, shared)
}

pub fn host() -> (Host, HcId, Arc<MockShared>) {
    host_with(HostConfig::default(), Speed::High)
}

/// A host with one enumerated and configured device.
pub fn configured(config: HostConfig) -> (Host, Arc<Device>, Arc<MockShared>) {
    let (host, id, shared) = host_with(config, Speed::High);
    let dev = host
        .device_connect(id, DeviceAttach::new(Speed::High, 1))
        .unwrap();
    dev.set_configuration(1).unwrap();
    (host, dev, shared)
}
