//! Bounded step FIFO between a ring algorithm and one proxy thread.

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Fixed-capacity circular queue.
///
/// Producers block while it is full, the consumer blocks while it is empty,
/// and one condition variable carries both wakeups. Head never laps tail.
/// [`close`](Self::close) wakes everyone and makes the queue refuse new work.
pub struct ProxyFifo<T> {
    state: Mutex<Ring<T>>,
    cond: Condvar,
}

struct Ring<T> {
    entries: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn len(&self) -> usize {
        self.tail - self.head
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }
}

impl<T> ProxyFifo<T> {
    /// Queue holding `capacity` entries, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        ProxyFifo {
            state: Mutex::new(Ring {
                entries: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Maximum number of queued entries.
    pub fn capacity(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append `entry`, blocking while the queue is full.
    pub fn push(&self, entry: T) -> Result<()> {
        let mut ring = self.state.lock();
        while !ring.closed && ring.len() == ring.entries.len() {
            self.cond.wait(&mut ring);
        }
        if ring.closed {
            return Err(Error::ProxyStopped);
        }
        let idx = ring.tail & ring.mask();
        ring.entries[idx] = Some(entry);
        ring.tail += 1;
        self.cond.notify_all();
        Ok(())
    }

    /// Take the oldest entry, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.state.lock();
        loop {
            if ring.closed {
                return None;
            }
            if ring.len() > 0 {
                break;
            }
            self.cond.wait(&mut ring);
        }
        let idx = ring.head & ring.mask();
        let entry = ring.entries[idx].take();
        ring.head += 1;
        self.cond.notify_all();
        entry
    }

    /// Remove queued entries for which `drop_if` holds, keeping the rest in
    /// order. Entries the consumer has already taken are out of reach.
    ///
    /// Returns the number of entries removed.
    pub fn withdraw(&self, mut drop_if: impl FnMut(&T) -> bool) -> usize {
        let mut ring = self.state.lock();
        let mask = ring.mask();
        let (head, tail) = (ring.head, ring.tail);
        let mut kept = head;
        for pos in head..tail {
            match ring.entries[pos & mask].take() {
                Some(entry) if drop_if(&entry) => {}
                entry => {
                    ring.entries[kept & mask] = entry;
                    kept += 1;
                }
            }
        }
        ring.tail = kept;
        let removed = tail - kept;
        if removed > 0 {
            self.cond.notify_all();
        }
        removed
    }

    /// Refuse further pushes, wake all waiters and discard queued entries.
    ///
    /// Returns the number of entries discarded.
    pub fn close(&self) -> usize {
        let mut ring = self.state.lock();
        ring.closed = true;
        let discarded = ring.len();
        for slot in ring.entries.iter_mut() {
            *slot = None;
        }
        ring.head = ring.tail;
        self.cond.notify_all();
        discarded
    }
}
