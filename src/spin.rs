//! Busy-poll synchronization between producers and consumers of staging
//! memory.
//!
//! Device-side code cannot block on an OS primitive, so progress between a
//! kernel and its proxy is signalled through monotonically increasing step
//! counters ([`StepFlag`]) that the other side polls. What a waiter does
//! between polls is a [`Backoff`] policy supplied by the caller, which keeps
//! the spin behaviour explicit and lets tests substitute a deterministic one.

use std::sync::atomic::{AtomicU64, Ordering};

/// What to do between two unsuccessful polls.
pub trait Backoff {
    /// Called after a poll that made no progress.
    fn snooze(&mut self);

    /// Called after a poll that made progress.
    fn reset(&mut self);
}

/// Pure spin with a wrapping counter, the device-side idiom.
///
/// Each snooze increments a counter that wraps back to zero after `wrap`,
/// burning a few cycles without touching shared memory.
#[derive(Debug, Clone)]
pub struct SpinCounter {
    count: u32,
    wrap: u32,
    total: u64,
}

impl SpinCounter {
    /// Counter that wraps after `wrap`.
    pub fn new(wrap: u32) -> Self {
        SpinCounter {
            count: 0,
            wrap,
            total: 0,
        }
    }

    /// Number of snoozes since creation.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for SpinCounter {
    fn default() -> Self {
        SpinCounter::new(10)
    }
}

impl Backoff for SpinCounter {
    #[inline]
    fn snooze(&mut self) {
        self.count = if self.count >= self.wrap {
            0
        } else {
            self.count + 1
        };
        self.total += 1;
        std::hint::spin_loop();
    }

    #[inline]
    fn reset(&mut self) {}
}

/// Host-side idle policy: spin for a while, then yield the thread.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    idle: u32,
    spins_before_yield: u32,
}

impl IdleBackoff {
    /// Spin `spins_before_yield` times before starting to yield.
    pub fn new(spins_before_yield: u32) -> Self {
        IdleBackoff {
            idle: 0,
            spins_before_yield,
        }
    }

    /// Consecutive snoozes since the last reset.
    pub fn idle(&self) -> u32 {
        self.idle
    }
}

impl Backoff for IdleBackoff {
    #[inline]
    fn snooze(&mut self) {
        self.idle = self.idle.saturating_add(1);
        if self.idle > self.spins_before_yield {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.idle = 0;
    }
}

/// Poll `ready` until it returns true, snoozing through `backoff` in between.
pub fn wait_until<B: Backoff + ?Sized>(mut ready: impl FnMut() -> bool, backoff: &mut B) {
    while !ready() {
        backoff.snooze();
    }
    backoff.reset();
}

/// Monotonic step counter published by one side and polled by the other.
///
/// Stores use release ordering and loads use acquire ordering, so data
/// written to staging memory before a [`publish`](StepFlag::publish) is
/// visible to a reader that observes the new value.
#[derive(Debug, Default)]
pub struct StepFlag(AtomicU64);

impl StepFlag {
    /// Flag starting at `value`.
    pub fn new(value: u64) -> Self {
        StepFlag(AtomicU64::new(value))
    }

    /// Current value.
    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Publish `value`. Values only ever grow.
    #[inline]
    pub fn publish(&self, value: u64) {
        debug_assert!(value >= self.0.load(Ordering::Relaxed));
        self.0.store(value, Ordering::Release);
    }

    /// Spin until the flag reaches at least `target`, returning the observed value.
    pub fn wait_for<B: Backoff + ?Sized>(&self, target: u64, backoff: &mut B) -> u64 {
        let mut seen = self.load();
        wait_until(
            || {
                seen = self.load();
                seen >= target
            },
            backoff,
        );
        seen
    }
}
