use alloc::sync::Arc;
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use crossbeam::queue::ArrayQueue;
use futures::task::AtomicWaker;

use crate::{
    err::*,
    osal::{Kernel, spin_until},
    urb::UrbHandle,
};

/// Counting signal that can be raised from interrupt context and waited on
/// either by spinning or as a future.
pub(crate) struct Semaphore {
    count: AtomicUsize,
    waker: AtomicWaker,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            waker: AtomicWaker::new(),
        }
    }

    pub fn give(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.waker.wake();
    }

    pub fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    pub fn take_timeout(&self, kernel: Kernel, timeout: Duration) -> bool {
        spin_until(kernel, timeout, || self.try_take())
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn register(&self, cx: &mut Context<'_>) {
        self.waker.register(cx.waker());
    }

    pub fn wake(&self) {
        self.waker.wake();
    }

    pub fn available(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

type Entry = (UrbHandle, u32);

/// Bounded FIFO carrying finished asynchronous transfers out of interrupt
/// context.
///
/// Producers reserve a slot before their transfer is scheduled, so the push
/// done by the completion path cannot fail.
pub(crate) struct CompletionQueue {
    fifo: ArrayQueue<Entry>,
    reserved: AtomicUsize,
    signal: Semaphore,
    running: AtomicBool,
    pushed: AtomicUsize,
    dispatched: AtomicUsize,
}

impl CompletionQueue {
    pub fn new(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            fifo: ArrayQueue::new(depth.max(1)),
            reserved: AtomicUsize::new(0),
            signal: Semaphore::new(),
            running: AtomicBool::new(true),
            pushed: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
        })
    }

    pub fn reserve(&self) -> Result {
        let cap = self.fifo.capacity();
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                (r < cap).then_some(r + 1)
            })
            .map(|_| ())
            .map_err(|_| USBError::Busy)
    }

    /// Gives back a reservation whose transfer finished without being queued.
    pub fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
    }

    pub fn push(&self, urb: UrbHandle, generation: u32) {
        if self.fifo.push((urb, generation)).is_err() {
            error!("completion queue overflow, entry dropped");
            return;
        }
        self.pushed.fetch_add(1, Ordering::AcqRel);
        self.signal.give();
    }

    fn pop(&self) -> Option<Entry> {
        let entry = self.fifo.pop()?;
        self.release();
        Some(entry)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signal.wake();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Consumer side of the completion FIFO: pops finished transfers and runs
/// their callbacks outside interrupt context.
pub struct CompletionDispatcher {
    queue: Arc<CompletionQueue>,
}

impl CompletionDispatcher {
    pub(crate) fn new(queue: Arc<CompletionQueue>) -> Self {
        Self { queue }
    }

    /// Runs until the owning [`Host`](crate::Host) is dropped and every queued
    /// completion has been delivered.
    pub async fn run(&self) {
        loop {
            if self.queue.signal.try_take() {
                self.dispatch_one();
                continue;
            }
            if !self.queue.is_running() {
                break;
            }
            Pending {
                queue: &self.queue,
            }
            .await;
        }
        debug!("completion dispatcher stopped");
    }

    /// Delivers whatever is queued right now. Returns the number of entries
    /// popped.
    pub fn dispatch_pending(&self) -> usize {
        let mut n = 0;
        while self.queue.signal.try_take() {
            self.dispatch_one();
            n += 1;
        }
        n
    }

    fn dispatch_one(&self) {
        let Some((urb, generation)) = self.queue.pop() else {
            warn!("completion signalled with an empty queue");
            return;
        };
        self.queue.dispatched.fetch_add(1, Ordering::AcqRel);
        urb.finish_queued(generation);
    }

    pub fn pushed(&self) -> usize {
        self.queue.pushed.load(Ordering::Acquire)
    }

    pub fn dispatched(&self) -> usize {
        self.queue.dispatched.load(Ordering::Acquire)
    }
}

struct Pending<'a> {
    queue: &'a CompletionQueue,
}

impl Future for Pending<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ready = |q: &CompletionQueue| q.signal.available() > 0 || !q.is_running();
        if ready(self.queue) {
            return Poll::Ready(());
        }
        self.queue.signal.register(cx);
        if ready(self.queue) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
