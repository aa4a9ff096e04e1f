use alloc::{boxed::Box, vec::Vec};
use core::{ops::Deref, time::Duration};

use usbh_if::transfer::{Direction, EndpointType};

use super::{Endpoint, TransferWaiter};
use crate::{err::*, urb::Completion};

pub struct EndpointBulkIn {
    pub(crate) raw: Endpoint,
}

impl EndpointBulkIn {
    /// Reads into `buf`, blocking until the transfer completes or `timeout`
    /// elapses.
    pub fn transfer(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.raw.read(EndpointType::Bulk, buf, timeout)
    }

    pub fn submit(
        &self,
        buf: Vec<u8>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Bulk,
            Direction::In,
            buf,
            None,
            Box::new(callback),
        )
    }

    pub fn submit_and_wait(&self, buf: Vec<u8>) -> Result<TransferWaiter> {
        self.raw
            .submit_and_wait(EndpointType::Bulk, Direction::In, buf, None)
    }
}

impl TryFrom<Endpoint> for EndpointBulkIn {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Bulk, Direction::In)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointBulkIn {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

pub struct EndpointBulkOut {
    pub(crate) raw: Endpoint,
}

impl EndpointBulkOut {
    pub fn transfer(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.raw.write(EndpointType::Bulk, buf, timeout)
    }

    pub fn submit(
        &self,
        buf: Vec<u8>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Bulk,
            Direction::Out,
            buf,
            None,
            Box::new(callback),
        )
    }

    pub fn submit_and_wait(&self, buf: Vec<u8>) -> Result<TransferWaiter> {
        self.raw
            .submit_and_wait(EndpointType::Bulk, Direction::Out, buf, None)
    }
}

impl TryFrom<Endpoint> for EndpointBulkOut {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Bulk, Direction::Out)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointBulkOut {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}
