use alloc::{boxed::Box, vec::Vec};
use core::{ops::Deref, time::Duration};

use usbh_if::transfer::{Direction, EndpointType};

use super::{Endpoint, TransferWaiter};
use crate::{err::*, urb::Completion};

pub struct EndpointInterruptIn {
    pub(crate) raw: Endpoint,
}

impl EndpointInterruptIn {
    pub fn transfer(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.raw.read(EndpointType::Interrupt, buf, timeout)
    }

    /// Queues one poll of the endpoint. Resubmit from `callback` to keep
    /// polling.
    pub fn submit(
        &self,
        buf: Vec<u8>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Interrupt,
            Direction::In,
            buf,
            None,
            Box::new(callback),
        )
    }

    pub fn submit_and_wait(&self, buf: Vec<u8>) -> Result<TransferWaiter> {
        self.raw
            .submit_and_wait(EndpointType::Interrupt, Direction::In, buf, None)
    }
}

impl TryFrom<Endpoint> for EndpointInterruptIn {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Interrupt, Direction::In)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointInterruptIn {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

pub struct EndpointInterruptOut {
    pub(crate) raw: Endpoint,
}

impl EndpointInterruptOut {
    pub fn transfer(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.raw.write(EndpointType::Interrupt, buf, timeout)
    }

    pub fn submit(
        &self,
        buf: Vec<u8>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Interrupt,
            Direction::Out,
            buf,
            None,
            Box::new(callback),
        )
    }
}

impl TryFrom<Endpoint> for EndpointInterruptOut {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Interrupt, Direction::Out)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointInterruptOut {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}
