use alloc::{sync::Arc, vec::Vec};

use spin::RwLock;

use crate::{device::Device, err::*};

/// A driver sitting on top of the core, told about devices as they come and
/// go.
pub trait ClassDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Offered every newly enumerated device. Returns `true` to claim it.
    fn probe(&self, device: &Arc<Device>) -> bool;

    /// The claimed device is gone. No I/O to it is possible any more.
    fn disconnect(&self, device: &Arc<Device>);

    fn suspend(&self, _device: &Arc<Device>) {}

    fn resume(&self, _device: &Arc<Device>) {}
}

pub(crate) struct ClassRegistry {
    drivers: RwLock<Vec<Arc<dyn ClassDriver>>>,
    capacity: usize,
}

impl ClassRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            drivers: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn register(&self, driver: Arc<dyn ClassDriver>) -> Result {
        let mut drivers = self.drivers.write();
        if drivers.len() >= self.capacity {
            return Err(USBError::SlotLimitReached);
        }
        debug!("class driver {} registered", driver.name());
        drivers.push(driver);
        Ok(())
    }

    /// Offers `device` to each driver in registration order and returns the
    /// first one that claims it.
    pub fn probe(&self, device: &Arc<Device>) -> Option<Arc<dyn ClassDriver>> {
        let drivers = self.drivers.read().clone();
        let claimed = drivers.into_iter().find(|d| d.probe(device));
        match &claimed {
            Some(d) => info!("dev {}: claimed by {}", device.address(), d.name()),
            None => warn!(
                "dev {}: no class driver for {:04x}:{:04x}",
                device.address(),
                device.descriptor().vendor_id,
                device.descriptor().product_id
            ),
        }
        claimed
    }
}
