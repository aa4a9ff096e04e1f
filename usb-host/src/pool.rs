use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    queue::CompletionQueue,
    urb::{Urb, UrbKind},
};

/// Fixed capacity slab of indices with checked acquire and release.
pub(crate) struct IndexPool {
    inner: Mutex<IndexPoolInner>,
}

struct IndexPoolInner {
    free: Vec<usize>,
    used: Vec<bool>,
}

impl IndexPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(IndexPoolInner {
                free: (0..capacity).rev().collect(),
                used: alloc::vec![false; capacity],
            }),
        }
    }

    pub fn acquire(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        let ix = inner.free.pop()?;
        inner.used[ix] = true;
        Some(ix)
    }

    /// Returns `false` when `ix` is out of range or not currently acquired.
    pub fn release(&self, ix: usize) -> bool {
        let mut inner = self.inner.lock();
        match inner.used.get_mut(ix) {
            Some(used) if *used => {
                *used = false;
                inner.free.push(ix);
                true
            }
            _ => false,
        }
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }
}

/// Extra transfer descriptors handed to endpoints whose own descriptor is
/// busy.
pub(crate) struct UrbPool {
    urbs: Vec<Arc<Urb>>,
    slots: IndexPool,
}

impl UrbPool {
    pub fn new(capacity: usize, queue: &Arc<CompletionQueue>) -> Self {
        Self {
            urbs: (0..capacity)
                .map(|i| Urb::new(UrbKind::Pool(i), queue.clone()))
                .collect(),
            slots: IndexPool::new(capacity),
        }
    }

    pub fn acquire(&self) -> Option<Arc<Urb>> {
        let ix = self.slots.acquire()?;
        self.urbs.get(ix).cloned()
    }

    pub fn release(&self, urb: &Urb) {
        if let UrbKind::Pool(ix) = urb.kind() {
            if !self.slots.release(ix) {
                warn!("extra URB {ix} released twice");
            }
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available()
    }
}
