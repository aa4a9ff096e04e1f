use alloc::sync::Arc;
use core::time::Duration;

use spin::Mutex;
use usbh_if::{
    err::TransferError,
    transfer::{Direction, SetupPacket, Token},
};

use super::{EndpointShared, SyncBuf};
use crate::err::*;

/// The default control pipe of a device.
///
/// The pipe itself is replaced while the device is being addressed; the
/// request lock keeps the three stages of one request together.
pub(crate) struct EndpointControl {
    pipe: Mutex<Arc<EndpointShared>>,
    request: Mutex<()>,
}

impl EndpointControl {
    pub fn new(pipe: Arc<EndpointShared>) -> Self {
        Self {
            pipe: Mutex::new(pipe),
            request: Mutex::new(()),
        }
    }

    pub fn pipe(&self) -> Arc<EndpointShared> {
        self.pipe.lock().clone()
    }

    pub fn replace(&self, pipe: Arc<EndpointShared>) -> Arc<EndpointShared> {
        core::mem::replace(&mut *self.pipe.lock(), pipe)
    }

    /// Runs SETUP, the optional DATA stage and STATUS. Returns the length of
    /// the DATA stage. The first failing stage ends the request.
    pub fn request(&self, setup: SetupPacket, data: SyncBuf<'_>, timeout: Duration) -> Result<usize> {
        let len = setup.length as usize;
        let dir = setup.direction();
        match &data {
            SyncBuf::In(b) if dir == Direction::In && b.len() >= len => {}
            SyncBuf::Out(b) if dir == Direction::Out && b.len() >= len => {}
            _ => return Err(USBError::InvalidArgument),
        }

        let _request = self.request.lock();
        let pipe = self.pipe();

        let sent = pipe.sync_transfer(
            Token::Setup,
            SyncBuf::Out(&setup.to_bytes()),
            None,
            timeout,
        )?;
        if sent != SetupPacket::LEN {
            debug!("{}: SETUP moved {sent} bytes", pipe.info);
            return Err(TransferError::DataBuffer.into());
        }

        let mut actual = 0;
        if len > 0 {
            let data = match data {
                SyncBuf::In(b) => SyncBuf::In(&mut b[..len]),
                SyncBuf::Out(b) => SyncBuf::Out(&b[..len]),
            };
            actual = pipe.sync_transfer(dir.into(), data, None, timeout)?;
        }

        let status = if len > 0 { dir.opposite() } else { Direction::In };
        pipe.sync_transfer(status.into(), SyncBuf::Out(&[]), None, timeout)?;
        Ok(actual)
    }

    pub fn reset(&self) -> Result {
        self.pipe().reset()
    }

    pub fn close(&self) -> Result {
        self.pipe().close()
    }
}
