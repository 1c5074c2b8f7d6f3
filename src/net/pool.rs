//! Growable pool of in-flight request slots.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Slots for in-flight asynchronous operations.
///
/// A slot is acquired before an operation is issued, filled with the
/// backend's request state, and released exactly once when the operation
/// completes. When every slot is in use the pool grows by a fixed increment;
/// it never shrinks. Free slots are found by a linear scan from index zero,
/// so the lowest free index is always reused first.
pub struct RequestPool<S> {
    inner: Mutex<PoolInner<S>>,
    increment: usize,
}

struct PoolInner<S> {
    slots: Vec<Option<S>>,
    used: Vec<bool>,
    growth_events: usize,
}

impl<S> RequestPool<S> {
    /// Empty pool that grows by `increment` slots at a time.
    ///
    /// # Panics
    ///
    /// Panics if `increment` is zero.
    pub fn new(increment: usize) -> Self {
        assert!(increment > 0, "request pool increment must be non-zero");
        RequestPool {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                used: Vec::new(),
                growth_events: 0,
            }),
            increment,
        }
    }

    /// Reserve a free slot and return its index.
    pub fn acquire(&self) -> usize {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.used.iter().position(|used| !used) {
            inner.used[idx] = true;
            return idx;
        }

        let idx = inner.used.len();
        let capacity = idx + self.increment;
        inner.slots.resize_with(capacity, || None);
        inner.used.resize(capacity, false);
        inner.growth_events += 1;
        inner.used[idx] = true;
        debug!(capacity, "request pool grown");
        idx
    }

    /// Store backend state in an acquired slot.
    pub fn set(&self, idx: usize, state: S) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.used.get(idx).copied().unwrap_or(false) {
            return Err(Error::InvalidRequest);
        }
        inner.slots[idx] = Some(state);
        Ok(())
    }

    /// Run `f` on the state of an acquired slot.
    pub fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        if !inner.used.get(idx).copied().unwrap_or(false) {
            return Err(Error::InvalidRequest);
        }
        inner.slots[idx].as_mut().map(f).ok_or(Error::InvalidRequest)
    }

    /// Return a slot to the pool, handing back its state.
    ///
    /// Releasing a slot that is not in use is an error, so double releases
    /// are caught.
    pub fn release(&self, idx: usize) -> Result<Option<S>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.used.get_mut(idx) {
            Some(used) if *used => {
                *used = false;
                Ok(inner.slots[idx].take())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    /// Total slots, used or free.
    pub fn capacity(&self) -> usize {
        self.inner.lock().used.len()
    }

    /// Slots currently in use.
    pub fn live(&self) -> usize {
        self.inner.lock().used.iter().filter(|used| **used).count()
    }

    /// Number of times the pool has grown.
    pub fn growth_events(&self) -> usize {
        self.inner.lock().growth_events
    }

    /// Growth increment.
    pub fn increment(&self) -> usize {
        self.increment
    }
}
