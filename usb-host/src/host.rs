use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use id_arena::{Arena, Id};
use spin::{Mutex, RwLock};
use usbh_if::transfer::Speed;

use crate::{
    backend::HcdOp,
    class::{ClassDriver, ClassRegistry},
    config::HostConfig,
    device::{Device, DeviceAttach},
    enumerate::{EnumerateRequest, enumerate},
    ep::TransferContext,
    err::*,
    osal::{Kernel, KernelOp},
    pool::{IndexPool, UrbPool},
    queue::{CompletionDispatcher, CompletionQueue},
};

pub type HcId = Id<Arc<HostController>>;

/// One host controller and its driver.
pub struct HostController {
    hcd: Mutex<Box<dyn HcdOp>>,
    speed: Speed,
    virtual_root_hub: bool,
    root_hub_address: u8,
    root_hub: Mutex<Option<Arc<Device>>>,
}

impl HostController {
    /// Runs `f` with exclusive access to the driver.
    pub(crate) fn with_hcd<R>(&self, f: impl FnOnce(&mut dyn HcdOp) -> R) -> R {
        let mut hcd = self.hcd.lock();
        f(hcd.as_mut())
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn virtual_root_hub(&self) -> bool {
        self.virtual_root_hub
    }

    pub fn root_hub_address(&self) -> u8 {
        self.root_hub_address
    }

    pub fn root_hub(&self) -> Option<Arc<Device>> {
        self.root_hub.lock().clone()
    }

    pub fn frame_number(&self) -> u32 {
        self.with_hcd(|h| h.frame_number())
    }
}

struct Attached {
    device: Arc<Device>,
    driver: Option<Arc<dyn ClassDriver>>,
}

enum Slot {
    Free,
    Reserved,
    Attached(Attached),
}

/// Address `n` lives at index `n - 1`.
struct DeviceTable {
    slots: Vec<Slot>,
}

impl DeviceTable {
    fn new(max_devices: usize) -> Self {
        let n = max_devices.min(127);
        Self {
            slots: (0..n).map(|_| Slot::Free).collect(),
        }
    }

    fn address(ix: usize) -> u8 {
        (ix + 1) as u8
    }

    fn slot(&mut self, address: u8) -> Option<&mut Slot> {
        (address as usize)
            .checked_sub(1)
            .and_then(|ix| self.slots.get_mut(ix))
    }

    fn reserve_lowest(&mut self) -> Option<u8> {
        let ix = self.slots.iter().position(|s| matches!(s, Slot::Free))?;
        self.slots[ix] = Slot::Reserved;
        Some(Self::address(ix))
    }

    fn reserve_highest(&mut self) -> Option<u8> {
        let ix = self.slots.iter().rposition(|s| matches!(s, Slot::Free))?;
        self.slots[ix] = Slot::Reserved;
        Some(Self::address(ix))
    }

    fn set(&mut self, address: u8, slot: Slot) {
        if let Some(s) = self.slot(address) {
            *s = slot;
        }
    }

    /// Takes the attached device out, leaving the address reserved.
    fn detach(&mut self, address: u8) -> Option<Attached> {
        let slot = self.slot(address)?;
        match core::mem::replace(slot, Slot::Reserved) {
            Slot::Attached(a) => Some(a),
            other => {
                *slot = other;
                None
            }
        }
    }

    fn get(&self, address: u8) -> Option<&Attached> {
        let ix = (address as usize).checked_sub(1)?;
        match self.slots.get(ix)? {
            Slot::Attached(a) => Some(a),
            _ => None,
        }
    }

    fn attached(&self) -> impl Iterator<Item = &Attached> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Attached(a) => Some(a),
            _ => None,
        })
    }
}

/// The USB host stack: controllers, the device address space, transfer pools
/// and the class driver registry.
pub struct Host {
    config: HostConfig,
    ctx: Arc<TransferContext>,
    hcs: RwLock<Arena<Arc<HostController>>>,
    devices: Mutex<DeviceTable>,
    classes: ClassRegistry,
    dispatcher_taken: AtomicBool,
}

impl Host {
    pub fn new(kernel: &'static dyn KernelOp, config: HostConfig) -> Self {
        let kernel: Kernel = kernel;
        let queue = CompletionQueue::new(config.completion_queue_depth);
        let ctx = Arc::new(TransferContext {
            kernel,
            urbs: UrbPool::new(config.extra_urbs, &queue),
            isoc: IndexPool::new(config.isoc_descriptors),
            queue,
            std_req_timeout: config.std_req_timeout,
        });
        Self {
            devices: Mutex::new(DeviceTable::new(config.max_devices)),
            classes: ClassRegistry::new(config.max_class_drivers),
            hcs: RwLock::new(Arena::new()),
            dispatcher_taken: AtomicBool::new(false),
            ctx,
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Hands out the completion dispatcher. Only the first call returns it.
    ///
    /// Callbacks of asynchronous transfers run wherever the dispatcher is
    /// driven.
    pub fn take_dispatcher(&self) -> Option<CompletionDispatcher> {
        if self.dispatcher_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(CompletionDispatcher::new(self.ctx.queue.clone()))
    }

    pub fn register_class_driver(&self, driver: Arc<dyn ClassDriver>) -> Result {
        self.classes.register(driver)
    }

    /// Extra transfer descriptors not in use right now.
    pub fn free_extra_urbs(&self) -> usize {
        self.ctx.urbs.available()
    }

    /// Initializes the driver and adds its controller. The root hub gets the
    /// highest free address.
    pub fn hc_add(&self, hcd: impl HcdOp) -> Result<HcId> {
        let mut hcs = self.hcs.write();
        if hcs.len() >= self.config.max_host_controllers {
            return Err(USBError::SlotLimitReached);
        }
        let root_hub_address = self
            .devices
            .lock()
            .reserve_highest()
            .ok_or(USBError::SlotLimitReached)?;

        let mut hcd: Box<dyn HcdOp> = Box::new(hcd);
        if let Err(e) = hcd.init() {
            self.devices.lock().set(root_hub_address, Slot::Free);
            return Err(e);
        }
        let speed = hcd.speed();
        let virtual_root_hub = hcd.virtual_root_hub();

        let id = hcs.alloc(Arc::new(HostController {
            hcd: Mutex::new(hcd),
            speed,
            virtual_root_hub,
            root_hub_address,
            root_hub: Mutex::new(None),
        }));
        info!(
            "host controller added: {speed:?}, root hub at {root_hub_address}{}",
            if virtual_root_hub { " (virtual)" } else { "" }
        );
        Ok(id)
    }

    pub fn hc(&self, id: HcId) -> Result<Arc<HostController>> {
        self.hcs.read().get(id).cloned().ok_or(USBError::NotFound)
    }

    /// Connects the root hub, then starts the controller. A root hub that
    /// fails to enumerate is left disconnected; the controller is started
    /// anyway and its result returned.
    pub fn hc_start(&self, id: HcId) -> Result {
        let hc = self.hc(id)?;
        if hc.root_hub().is_none() {
            let attach = DeviceAttach::new(hc.speed(), 0);
            match self.connect(&hc, id, attach, true, hc.root_hub_address()) {
                Ok(device) => *hc.root_hub.lock() = Some(device),
                Err(e) => warn!("root hub connect failed: {e}"),
            }
        }
        hc.with_hcd(|h| h.start())
    }

    /// Disconnects the root hub, then stops the controller.
    pub fn hc_stop(&self, id: HcId) -> Result {
        let hc = self.hc(id)?;
        let root = hc.root_hub.lock().take();
        if let Some(root) = root {
            self.device_disconnect(root.address());
        }
        hc.with_hcd(|h| h.stop())
    }

    pub fn hc_frame_number(&self, id: HcId) -> Result<u32> {
        Ok(self.hc(id)?.frame_number())
    }

    fn controllers(&self) -> Vec<Arc<HostController>> {
        self.hcs.read().iter().map(|(_, hc)| hc.clone()).collect()
    }

    fn claimed(&self) -> Vec<(Arc<Device>, Arc<dyn ClassDriver>)> {
        self.devices
            .lock()
            .attached()
            .filter_map(|a| Some((a.device.clone(), a.driver.clone()?)))
            .collect()
    }

    /// Suspends class drivers, then every controller.
    pub fn suspend(&self) -> Result {
        for (device, driver) in self.claimed() {
            driver.suspend(&device);
        }
        for hc in self.controllers() {
            hc.with_hcd(|h| h.suspend())?;
        }
        Ok(())
    }

    /// Resumes every controller, then the class drivers.
    pub fn resume(&self) -> Result {
        for hc in self.controllers() {
            hc.with_hcd(|h| h.resume())?;
        }
        for (device, driver) in self.claimed() {
            driver.resume(&device);
        }
        Ok(())
    }

    /// Enumerates a device that appeared on `hc` and offers it to the class
    /// drivers.
    pub fn device_connect(&self, hc: HcId, attach: DeviceAttach) -> Result<Arc<Device>> {
        let controller = self.hc(hc)?;
        let address = self
            .devices
            .lock()
            .reserve_lowest()
            .ok_or(USBError::SlotLimitReached)?;
        self.connect(&controller, hc, attach, false, address)
            .inspect_err(|_| self.devices.lock().set(address, Slot::Free))
    }

    fn connect(
        &self,
        hc: &Arc<HostController>,
        hc_id: HcId,
        attach: DeviceAttach,
        is_root_hub: bool,
        address: u8,
    ) -> Result<Arc<Device>> {
        let device = Arc::new(enumerate(EnumerateRequest {
            hc,
            hc_id,
            ctx: &self.ctx,
            config: &self.config,
            attach,
            is_root_hub,
            address,
        })?);
        info!(
            "dev {address}: {:04x}:{:04x} attached on port {}",
            device.descriptor().vendor_id,
            device.descriptor().product_id,
            attach.port
        );
        let driver = self.classes.probe(&device);
        self.devices.lock().set(
            address,
            Slot::Attached(Attached {
                device: device.clone(),
                driver,
            }),
        );
        Ok(device)
    }

    /// Tears down the device at `address`: class driver notification, then
    /// the default pipe. The address becomes free again unless it belongs to
    /// a root hub.
    pub fn device_disconnect(&self, address: u8) {
        let Some(attached) = self.devices.lock().detach(address) else {
            warn!("dev {address}: disconnect of unknown device");
            return;
        };
        let Attached { device, driver } = attached;
        if let Some(driver) = driver {
            driver.disconnect(&device);
        }
        device.detach();
        if !device.is_root_hub() {
            self.devices.lock().set(address, Slot::Free);
        }
        info!("dev {address}: detached");
    }

    pub fn device(&self, address: u8) -> Option<Arc<Device>> {
        self.devices.lock().get(address).map(|a| a.device.clone())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .lock()
            .attached()
            .map(|a| a.device.clone())
            .collect()
    }

    pub fn root_hub(&self, hc: HcId) -> Option<Arc<Device>> {
        self.hc(hc).ok()?.root_hub()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.ctx.queue.stop();
    }
}
