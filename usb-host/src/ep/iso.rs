use alloc::{boxed::Box, vec::Vec};
use core::{ops::Deref, time::Duration};

use usbh_if::transfer::{Direction, EndpointType};

use super::{Endpoint, SyncBuf, TransferWaiter};
use crate::{
    err::*,
    urb::{Completion, IsocRequest},
};

pub struct EndpointIsoIn {
    pub(crate) raw: Endpoint,
}

impl EndpointIsoIn {
    /// Receives `req.frame_count()` frames packed back to back into `buf`.
    /// Per-frame lengths and errors are written back into `req`.
    pub fn transfer(
        &self,
        buf: &mut [u8],
        req: &mut IsocRequest,
        timeout: Duration,
    ) -> Result<usize> {
        self.raw
            .isoc(Direction::In, SyncBuf::In(buf), req, timeout)
    }

    pub fn submit(
        &self,
        buf: Vec<u8>,
        req: IsocRequest,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Isochronous,
            Direction::In,
            buf,
            Some(req),
            Box::new(callback),
        )
    }

    pub fn submit_and_wait(&self, buf: Vec<u8>, req: IsocRequest) -> Result<TransferWaiter> {
        self.raw.submit_and_wait(
            EndpointType::Isochronous,
            Direction::In,
            buf,
            Some(req),
        )
    }
}

impl TryFrom<Endpoint> for EndpointIsoIn {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Isochronous, Direction::In)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointIsoIn {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

pub struct EndpointIsoOut {
    pub(crate) raw: Endpoint,
}

impl EndpointIsoOut {
    pub fn transfer(&self, buf: &[u8], req: &mut IsocRequest, timeout: Duration) -> Result<usize> {
        self.raw
            .isoc(Direction::Out, SyncBuf::Out(buf), req, timeout)
    }

    pub fn submit(
        &self,
        buf: Vec<u8>,
        req: IsocRequest,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result {
        self.raw.submit(
            EndpointType::Isochronous,
            Direction::Out,
            buf,
            Some(req),
            Box::new(callback),
        )
    }
}

impl TryFrom<Endpoint> for EndpointIsoOut {
    type Error = USBError;

    fn try_from(raw: Endpoint) -> Result<Self> {
        raw.check(EndpointType::Isochronous, Direction::Out)?;
        Ok(Self { raw })
    }
}

impl Deref for EndpointIsoOut {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}
