use alloc::{boxed::Box, format, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
};

use num_enum::{FromPrimitive, IntoPrimitive};
use spin::Mutex;
use usbh_if::transfer::Token;

use crate::{
    backend::EndpointInfo,
    ep::EndpointShared,
    err::*,
    queue::{CompletionQueue, Semaphore},
};

/// Lifecycle of a transfer descriptor.
///
/// `None -> Scheduled -> Queued | Aborted -> None`. `Queued -> Aborted` is
/// only taken by asynchronous descriptors still waiting in the completion
/// FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum UrbState {
    #[num_enum(default)]
    None = 0,
    Scheduled = 1,
    Queued = 2,
    Aborted = 3,
}

impl UrbState {
    pub fn can_transition(self, to: UrbState) -> bool {
        use UrbState::*;
        matches!(
            (self, to),
            (None, Scheduled)
                | (Scheduled, Queued)
                | (Scheduled, Aborted)
                | (Queued, Aborted)
                | (Scheduled, None)
                | (Queued, None)
                | (Aborted, None)
        )
    }
}

/// One frame of an isochronous transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsocPacket {
    pub length: usize,
    pub actual: usize,
    pub error: Option<TransferError>,
}

/// Per-frame layout of an isochronous transfer. Frames are packed back to
/// back in the transfer buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsocRequest {
    pub start_frame: u32,
    pub packets: Vec<IsocPacket>,
}

impl IsocRequest {
    pub fn new(start_frame: u32, lengths: &[usize]) -> Self {
        Self {
            start_frame,
            packets: lengths
                .iter()
                .map(|&length| IsocPacket {
                    length,
                    actual: 0,
                    error: None,
                })
                .collect(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.packets.len()
    }

    pub fn total_len(&self) -> usize {
        self.packets.iter().map(|p| p.length).sum()
    }

    pub(crate) fn validate(&self, buffer_len: usize) -> Result {
        if self.packets.is_empty() || self.total_len() > buffer_len {
            return Err(USBError::InvalidArgument);
        }
        Ok(())
    }
}

/// Outcome handed to the callback of an asynchronous transfer.
#[derive(Debug)]
pub struct Completion {
    /// The buffer the transfer was submitted with.
    pub buffer: Vec<u8>,
    /// Bytes transferred, or why the transfer failed.
    pub result: Result<usize>,
    pub isoc: Option<IsocRequest>,
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrbKind {
    /// Owned by an endpoint.
    Embedded,
    /// Slot of the host wide extra pool.
    Pool(usize),
}

pub(crate) struct UrbSetup {
    pub endpoint: Arc<EndpointShared>,
    pub token: Token,
    pub buffer: Vec<u8>,
    pub isoc: Option<IsocRequest>,
    pub isoc_slot: Option<usize>,
    pub callback: Option<CompletionFn>,
}

struct UrbRequest {
    endpoint: Option<Arc<EndpointShared>>,
    token: Token,
    buffer: Vec<u8>,
    actual: usize,
    error: Option<TransferError>,
    isoc: Option<IsocRequest>,
    isoc_slot: Option<usize>,
    callback: Option<CompletionFn>,
    outcome: Option<Result<usize>>,
}

impl UrbRequest {
    fn empty() -> Self {
        Self {
            endpoint: None,
            token: Token::Out,
            buffer: Vec::new(),
            actual: 0,
            error: None,
            isoc: None,
            isoc_slot: None,
            callback: None,
            outcome: None,
        }
    }
}

/// Data a synchronous caller takes back once its transfer is over.
pub(crate) struct SyncResult {
    pub outcome: Result<usize>,
    pub buffer: Vec<u8>,
    pub isoc: Option<IsocRequest>,
}

pub(crate) struct Urb {
    kind: UrbKind,
    state: AtomicU8,
    claimed: AtomicBool,
    is_async: AtomicBool,
    generation: AtomicU32,
    signal: Semaphore,
    /// Serializes finalization so that HCD completion runs once per
    /// submission.
    finalize: Mutex<()>,
    req: Mutex<UrbRequest>,
    queue: Arc<CompletionQueue>,
}

impl Urb {
    pub fn new(kind: UrbKind, queue: Arc<CompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: AtomicU8::new(UrbState::None.into()),
            claimed: AtomicBool::new(false),
            is_async: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            signal: Semaphore::new(),
            finalize: Mutex::new(()),
            req: Mutex::new(UrbRequest::empty()),
            queue,
        })
    }

    pub fn kind(&self) -> UrbKind {
        self.kind
    }

    pub fn state(&self) -> UrbState {
        UrbState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_async(&self) -> bool {
        self.is_async.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    fn transition(&self, from: UrbState, to: UrbState) -> bool {
        debug_assert!(from.can_transition(to));
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unclaim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Loads a new request. The descriptor must be claimed and idle.
    pub fn prepare(&self, setup: UrbSetup) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.signal.reset();
        self.is_async
            .store(setup.callback.is_some(), Ordering::Release);
        let mut req = self.req.lock();
        *req = UrbRequest {
            endpoint: Some(setup.endpoint),
            token: setup.token,
            buffer: setup.buffer,
            actual: 0,
            error: None,
            isoc: setup.isoc,
            isoc_slot: setup.isoc_slot,
            callback: setup.callback,
            outcome: None,
        };
    }

    pub fn schedule(&self) -> bool {
        self.transition(UrbState::None, UrbState::Scheduled)
    }

    /// Rolls back a submission the HCD refused.
    pub fn unschedule(&self) {
        self.transition(UrbState::Scheduled, UrbState::None);
    }

    /// Called by the HCD, possibly from interrupt context. Touches only
    /// atomics and the lock-free completion FIFO.
    fn done(self: &Arc<Self>) {
        if !self.transition(UrbState::Scheduled, UrbState::Queued) {
            trace!("URB completion ignored in state {:?}", self.state());
            return;
        }
        if self.is_async() {
            self.queue.push(UrbHandle(self.clone()), self.generation());
        } else {
            self.signal.give();
        }
    }

    /// Cancels the descriptor. Returns the state it was taken out of.
    pub fn abort(&self) -> Option<UrbState> {
        if self.transition(UrbState::Scheduled, UrbState::Aborted) {
            return Some(UrbState::Scheduled);
        }
        if self.is_async() && self.transition(UrbState::Queued, UrbState::Aborted) {
            return Some(UrbState::Queued);
        }
        None
    }

    pub fn wait(&self, kernel: crate::osal::Kernel, timeout: core::time::Duration) -> bool {
        self.signal.take_timeout(kernel, timeout)
    }

    pub fn wake(&self) {
        self.signal.give();
    }

    /// Completes a `Queued` or `Aborted` descriptor through the HCD.
    ///
    /// Synchronous descriptors keep their outcome for [`Urb::take_sync`].
    /// Asynchronous ones are released and their callback runs on the calling
    /// thread. When `generation` is given the call is a no-op unless it
    /// matches the descriptor's current generation.
    pub fn finalize(self: &Arc<Self>, generation: Option<u32>) -> bool {
        let guard = self.finalize.lock();
        if generation.is_some_and(|g| g != self.generation()) {
            return false;
        }
        let aborted = match self.state() {
            UrbState::Queued => false,
            UrbState::Aborted => true,
            _ => return false,
        };
        let endpoint = {
            let req = self.req.lock();
            if req.outcome.is_some() {
                return false;
            }
            match req.endpoint.clone() {
                Some(ep) => ep,
                None => return false,
            }
        };

        let handle = UrbHandle(self.clone());
        let hcd = if aborted {
            endpoint.path.urb_abort(&handle)
        } else {
            endpoint.path.urb_complete(&handle)
        };

        let mut req = self.req.lock();
        let outcome = if aborted {
            if let Err(e) = hcd {
                warn!("{}: HCD abort failed: {e}", endpoint.info);
            }
            req.actual = 0;
            Err(TransferError::Cancelled.into())
        } else {
            match (hcd, req.error.take()) {
                (Err(e), _) => Err(e),
                (Ok(()), Some(e)) => Err(e.into()),
                (Ok(()), None) => Ok(req.actual.min(req.buffer.len())),
            }
        };

        if !self.is_async() {
            req.outcome = Some(outcome);
            return true;
        }

        let callback = req.callback.take();
        let buffer = core::mem::take(&mut req.buffer);
        let isoc = req.isoc.take();
        let isoc_slot = req.isoc_slot.take();
        req.endpoint = None;
        drop(req);

        self.state.store(UrbState::None.into(), Ordering::Release);
        endpoint.retire(self, isoc_slot);
        drop(guard);

        if let Some(callback) = callback {
            callback(Completion {
                buffer,
                result: outcome,
                isoc,
            });
        }
        true
    }

    /// Collects a synchronous result and returns the descriptor to `None`.
    pub fn take_sync(&self) -> SyncResult {
        let _guard = self.finalize.lock();
        let mut req = self.req.lock();
        let outcome = req.outcome.take().unwrap_or_else(|| {
            Err(TransferError::Other(format!("URB finished in state {:?}", self.state())).into())
        });
        let result = SyncResult {
            outcome,
            buffer: core::mem::take(&mut req.buffer),
            isoc: req.isoc.take(),
        };
        *req = UrbRequest::empty();
        self.state.store(UrbState::None.into(), Ordering::Release);
        result
    }

    /// Drops a request that never reached the HCD.
    pub fn clear(&self) -> Option<CompletionFn> {
        let mut req = self.req.lock();
        let callback = req.callback.take();
        *req = UrbRequest::empty();
        self.state.store(UrbState::None.into(), Ordering::Release);
        callback
    }
}

/// Transfer descriptor as seen by a host controller driver.
///
/// [`UrbHandle::done`] is lock free and is the only method an interrupt
/// handler may call. Everything else takes the descriptor's lock, which task
/// context also holds, so the driver reads the request in `urb_submit` and
/// writes the outcome with [`UrbHandle::set_result`] and friends from
/// `urb_complete`.
#[derive(Clone)]
pub struct UrbHandle(pub(crate) Arc<Urb>);

impl UrbHandle {
    /// Stable identity of the descriptor while it is scheduled.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn state(&self) -> UrbState {
        self.0.state()
    }

    pub fn token(&self) -> Token {
        self.0.req.lock().token
    }

    pub fn endpoint(&self) -> Option<EndpointInfo> {
        self.0.req.lock().endpoint.as_ref().map(|ep| ep.info.clone())
    }

    pub fn len(&self) -> usize {
        self.0.req.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut req = self.0.req.lock();
        f(&mut req.buffer)
    }

    pub fn set_result(&self, result: core::result::Result<usize, TransferError>) {
        let mut req = self.0.req.lock();
        match result {
            Ok(actual) => {
                req.actual = actual;
                req.error = None;
            }
            Err(e) => {
                req.actual = 0;
                req.error = Some(e);
            }
        }
    }

    pub fn isoc(&self) -> Option<IsocRequest> {
        self.0.req.lock().isoc.clone()
    }

    pub fn set_isoc_frame(&self, frame: usize, actual: usize, error: Option<TransferError>) {
        let mut req = self.0.req.lock();
        if let Some(packet) = req.isoc.as_mut().and_then(|i| i.packets.get_mut(frame)) {
            packet.actual = actual;
            packet.error = error;
        }
    }

    /// Reports the hardware completion. Safe from interrupt context.
    pub fn done(&self) {
        self.0.done();
    }

    pub(crate) fn finish_queued(&self, generation: u32) {
        if !self.0.finalize(Some(generation)) {
            trace!("stale completion entry skipped");
        }
    }
}

impl PartialEq for UrbHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for UrbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrbHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
