use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use futures::task::AtomicWaker;
use spin::Mutex;
use usbh_if::transfer::{Direction, EndpointType, Token};

use crate::{
    backend::{DevicePath, EndpointInfo},
    err::*,
    osal::Kernel,
    pool::{IndexPool, UrbPool},
    queue::CompletionQueue,
    urb::{Completion, CompletionFn, IsocRequest, Urb, UrbKind, UrbSetup, UrbState},
};

mod bulk;
mod ctrl;
mod int;
mod iso;

pub use bulk::*;
pub(crate) use ctrl::*;
pub use int::*;
pub use iso::*;

/// Host wide resources every pipe draws from.
pub(crate) struct TransferContext {
    pub kernel: Kernel,
    pub urbs: UrbPool,
    pub isoc: IndexPool,
    pub queue: Arc<CompletionQueue>,
    pub std_req_timeout: Duration,
}

pub(crate) enum SyncBuf<'a> {
    Out(&'a [u8]),
    In(&'a mut [u8]),
}

impl SyncBuf<'_> {
    fn to_urb_buffer(&self) -> Vec<u8> {
        match self {
            SyncBuf::Out(b) => b.to_vec(),
            SyncBuf::In(b) => vec![0; b.len()],
        }
    }
}

pub(crate) struct EndpointShared {
    pub info: EndpointInfo,
    pub path: Arc<dyn DevicePath>,
    pub ctx: Arc<TransferContext>,
    open: AtomicBool,
    in_flight: AtomicUsize,
    embedded: Arc<Urb>,
    extras: Mutex<Vec<Arc<Urb>>>,
    /// Held for the whole of a synchronous transfer.
    xfer: Mutex<()>,
    /// Held from the open check until the HCD has the descriptor, and by
    /// `close` while it flips the open flag.
    gate: Mutex<()>,
}

impl EndpointShared {
    pub fn open(
        info: EndpointInfo,
        path: Arc<dyn DevicePath>,
        ctx: Arc<TransferContext>,
    ) -> Result<Arc<Self>> {
        path.ep_open(&info)?;
        debug!("{info}: opened, mps {}", info.max_packet_size);
        Ok(Arc::new(Self {
            embedded: Urb::new(UrbKind::Embedded, ctx.queue.clone()),
            info,
            path,
            ctx,
            open: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            extras: Mutex::new(Vec::new()),
            xfer: Mutex::new(()),
            gate: Mutex::new(()),
        }))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Opens the pipe again after [`EndpointShared::close`]. No-op when open.
    pub fn reopen(&self) -> Result {
        if self.is_open() {
            return Ok(());
        }
        self.path.ep_open(&self.info)?;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    /// Cancels everything outstanding and closes the pipe on the HCD.
    /// Idempotent.
    pub fn close(&self) -> Result {
        let urbs: Vec<Arc<Urb>> = {
            let _gate = self.gate.lock();
            if !self.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            core::iter::once(self.embedded.clone())
                .chain(self.extras.lock().iter().cloned())
                .collect()
        };
        for urb in &urbs {
            self.cancel(urb);
        }
        debug!("{}: closed", self.info);
        self.path.ep_close(&self.info)
    }

    pub fn reset(&self) -> Result {
        debug!("{}: reset", self.info);
        self.path.ep_abort(&self.info)?;
        self.close()?;
        self.reopen()
    }

    fn cancel(&self, urb: &Arc<Urb>) {
        let Some(prev) = urb.abort() else {
            return;
        };
        trace!("{}: cancelled URB in state {prev:?}", self.info);
        let is_async = urb.is_async();
        if is_async && prev == UrbState::Scheduled {
            // Never reached the FIFO, so its reservation is still held.
            self.ctx.queue.release();
        }
        urb.finalize(None);
        if !is_async {
            urb.wake();
        }
    }

    fn link(&self, urb: &Arc<Urb>) {
        self.extras.lock().push(urb.clone());
    }

    fn take_pool_urb(&self) -> Result<Arc<Urb>> {
        let urb = self.ctx.urbs.acquire().ok_or(USBError::NoMemory)?;
        urb.try_claim();
        self.link(&urb);
        Ok(urb)
    }

    fn claim_sync(&self) -> Result<Arc<Urb>> {
        if self.embedded.try_claim() {
            return Ok(self.embedded.clone());
        }
        self.take_pool_urb()
    }

    fn claim_async(&self) -> Result<Arc<Urb>> {
        if self.in_flight() == 0 && self.embedded.try_claim() {
            return Ok(self.embedded.clone());
        }
        self.take_pool_urb()
    }

    fn release_urb(&self, urb: &Arc<Urb>) {
        if let UrbKind::Pool(_) = urb.kind() {
            self.extras.lock().retain(|u| !Arc::ptr_eq(u, urb));
            urb.unclaim();
            self.ctx.urbs.release(urb);
        } else {
            urb.unclaim();
        }
    }

    /// Bookkeeping once an asynchronous descriptor has been finalized.
    pub(crate) fn retire(&self, urb: &Arc<Urb>, isoc_slot: Option<usize>) {
        self.release_urb(urb);
        if let Some(slot) = isoc_slot {
            self.ctx.isoc.release(slot);
        }
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn submit(&self, urb: &Arc<Urb>) -> Result {
        if self.path.ep_halted(&self.info) {
            debug!("{}: halted, submit refused", self.info);
            return Err(USBError::Retry);
        }
        if !urb.schedule() {
            return Err(USBError::Busy);
        }
        let handle = crate::urb::UrbHandle(urb.clone());
        if let Err(e) = self.path.urb_submit(&handle) {
            urb.unschedule();
            return Err(e);
        }
        Ok(())
    }

    /// Blocking transfer on this pipe. Returns the number of bytes moved.
    pub fn sync_transfer(
        self: &Arc<Self>,
        token: Token,
        data: SyncBuf<'_>,
        isoc: Option<&mut IsocRequest>,
        timeout: Duration,
    ) -> Result<usize> {
        let _xfer = self.xfer.lock();
        let gate = self.gate.lock();
        if !self.is_open() {
            return Err(USBError::NotOpen);
        }
        let urb = self.claim_sync()?;
        urb.prepare(UrbSetup {
            endpoint: self.clone(),
            token,
            buffer: data.to_urb_buffer(),
            isoc: isoc.as_deref().cloned(),
            isoc_slot: None,
            callback: None,
        });
        trace!("{}: sync {token:?}", self.info);

        if let Err(e) = self.submit(&urb) {
            urb.clear();
            self.release_urb(&urb);
            return Err(e);
        }
        drop(gate);

        let signalled = urb.wait(self.ctx.kernel, timeout);
        let timed_out = !signalled && urb.abort().is_some();
        urb.finalize(None);
        let result = urb.take_sync();
        self.release_urb(&urb);

        if timed_out {
            warn!("{}: transfer timed out after {timeout:?}", self.info);
            return Err(USBError::Timeout);
        }
        let n = result.outcome?;
        if let SyncBuf::In(buf) = data {
            let n = n.min(buf.len());
            buf[..n].copy_from_slice(&result.buffer[..n]);
        }
        if let (Some(dst), Some(src)) = (isoc, result.isoc) {
            *dst = src;
        }
        Ok(n)
    }

    /// Queues a transfer and returns at once. `callback` runs from the
    /// completion dispatcher, or from [`EndpointShared::close`] if the pipe is
    /// closed first.
    pub fn async_transfer(
        self: &Arc<Self>,
        token: Token,
        buffer: Vec<u8>,
        isoc: Option<IsocRequest>,
        callback: CompletionFn,
    ) -> Result {
        let _gate = self.gate.lock();
        if !self.is_open() {
            return Err(USBError::NotOpen);
        }
        self.ctx.queue.reserve()?;
        let isoc_slot = match &isoc {
            Some(_) => match self.ctx.isoc.acquire() {
                Some(slot) => Some(slot),
                None => {
                    self.ctx.queue.release();
                    return Err(USBError::NoMemory);
                }
            },
            None => None,
        };
        let urb = match self.claim_async() {
            Ok(urb) => urb,
            Err(e) => {
                if let Some(slot) = isoc_slot {
                    self.ctx.isoc.release(slot);
                }
                self.ctx.queue.release();
                return Err(e);
            }
        };
        urb.prepare(UrbSetup {
            endpoint: self.clone(),
            token,
            buffer,
            isoc,
            isoc_slot,
            callback: Some(callback),
        });
        trace!("{}: async {token:?}", self.info);

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.submit(&urb) {
            urb.clear();
            self.retire(&urb, isoc_slot);
            self.ctx.queue.release();
            return Err(e);
        }
        Ok(())
    }
}

/// An open pipe of a device.
///
/// Dropping the handle closes the pipe.
pub struct Endpoint {
    pub(crate) raw: Arc<EndpointShared>,
}

impl Endpoint {
    pub(crate) fn new(raw: Arc<EndpointShared>) -> Self {
        Self { raw }
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.raw.info
    }

    pub fn number(&self) -> u8 {
        self.raw.info.number
    }

    pub fn direction(&self) -> Option<Direction> {
        self.raw.info.direction
    }

    pub fn transfer_type(&self) -> EndpointType {
        self.raw.info.transfer_type
    }

    pub fn max_packet_size(&self) -> u16 {
        self.raw.info.max_packet_size
    }

    pub fn interval(&self) -> u32 {
        self.raw.info.interval
    }

    pub fn in_flight(&self) -> usize {
        self.raw.in_flight()
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_open()
    }

    /// Aborts all outstanding transfers, their callbacks see
    /// [`TransferError::Cancelled`].
    pub fn close(&self) -> Result {
        self.raw.close()
    }

    /// Aborts, closes and reopens the pipe on the HCD.
    pub fn reset(&self) -> Result {
        self.raw.reset()
    }

    fn check(&self, ty: EndpointType, dir: Direction) -> Result {
        if self.transfer_type() != ty || self.direction() != Some(dir) {
            return Err(USBError::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn read(&self, ty: EndpointType, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.check(ty, Direction::In)?;
        self.raw
            .sync_transfer(Token::In, SyncBuf::In(buf), None, timeout)
    }

    pub(crate) fn write(&self, ty: EndpointType, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.check(ty, Direction::Out)?;
        self.raw
            .sync_transfer(Token::Out, SyncBuf::Out(buf), None, timeout)
    }

    pub(crate) fn isoc(
        &self,
        dir: Direction,
        data: SyncBuf<'_>,
        req: &mut IsocRequest,
        timeout: Duration,
    ) -> Result<usize> {
        self.check(EndpointType::Isochronous, dir)?;
        let len = match &data {
            SyncBuf::In(b) => b.len(),
            SyncBuf::Out(b) => b.len(),
        };
        req.validate(len)?;
        self.raw
            .sync_transfer(dir.into(), data, Some(req), timeout)
    }

    pub(crate) fn submit(
        &self,
        ty: EndpointType,
        dir: Direction,
        buffer: Vec<u8>,
        isoc: Option<IsocRequest>,
        callback: CompletionFn,
    ) -> Result {
        self.check(ty, dir)?;
        if let Some(req) = &isoc {
            req.validate(buffer.len())?;
        }
        self.raw
            .async_transfer(dir.into(), buffer, isoc, callback)
    }

    pub(crate) fn submit_and_wait(
        &self,
        ty: EndpointType,
        dir: Direction,
        buffer: Vec<u8>,
        isoc: Option<IsocRequest>,
    ) -> Result<TransferWaiter> {
        let (waiter, slot) = TransferWaiter::new();
        self.submit(
            ty,
            dir,
            buffer,
            isoc,
            Box::new(move |c| slot.set_finished(c)),
        )?;
        Ok(waiter)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(e) = self.raw.close() {
            warn!("{}: close on drop failed: {e}", self.raw.info);
        }
    }
}

struct FinishedSlot {
    finished: AtomicBool,
    waker: AtomicWaker,
    data: Mutex<Option<Completion>>,
}

/// Handle for delivering a completion into a [`TransferWaiter`].
struct FinishedSender(Arc<FinishedSlot>);

impl FinishedSender {
    fn set_finished(self, completion: Completion) {
        *self.0.data.lock() = Some(completion);
        self.0.finished.store(true, Ordering::Release);
        self.0.waker.wake();
    }
}

/// Future resolving to the [`Completion`] of an asynchronous transfer.
pub struct TransferWaiter {
    slot: Arc<FinishedSlot>,
}

impl TransferWaiter {
    fn new() -> (Self, FinishedSender) {
        let slot = Arc::new(FinishedSlot {
            finished: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            data: Mutex::new(None),
        });
        (Self { slot: slot.clone() }, FinishedSender(slot))
    }

    fn get_finished(&self) -> Option<Completion> {
        if !self.slot.finished.load(Ordering::Acquire) {
            return None;
        }
        self.slot.data.lock().take()
    }
}

impl Future for TransferWaiter {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(c) = this.get_finished() {
            return Poll::Ready(c);
        }
        this.slot.waker.register(cx.waker());
        match this.get_finished() {
            Some(c) => Poll::Ready(c),
            None => Poll::Pending,
        }
    }
}
