//! Serialization of backend calls for backends without full thread support.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::debug;

use crate::ThreadLevel;

/// Whether backend calls run concurrently or one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Calls proceed without synchronization.
    Unlocked,
    /// Every call holds the backend lock.
    Serialized,
}

impl LockMode {
    /// Mode required for a backend reporting `provided`.
    pub fn for_thread_level(provided: ThreadLevel, force_lock: bool) -> Self {
        if force_lock || provided < ThreadLevel::Multiple {
            LockMode::Serialized
        } else {
            LockMode::Unlocked
        }
    }
}

/// Lock guarding every call into one backend instance.
///
/// The mode is decided on first use from the backend's thread level and the
/// force-lock override, then fixed for the lifetime of the lock. The decision
/// runs exactly once even when several threads race to make the first call.
#[derive(Debug)]
pub struct BackendLock {
    mode: OnceLock<LockMode>,
    force_lock: bool,
    mutex: Mutex<()>,
}

impl BackendLock {
    /// Undecided lock; `force_lock` overrides whatever the backend reports.
    pub fn new(force_lock: bool) -> Self {
        BackendLock {
            mode: OnceLock::new(),
            force_lock,
            mutex: Mutex::new(()),
        }
    }

    /// The lock mode, probing the backend with `probe` on first use.
    pub fn mode(&self, probe: impl FnOnce() -> ThreadLevel) -> LockMode {
        *self.mode.get_or_init(|| {
            let provided = probe();
            let mode = LockMode::for_thread_level(provided, self.force_lock);
            debug!(?provided, force_lock = self.force_lock, ?mode, "backend lock mode decided");
            mode
        })
    }

    /// Run one backend call under the decided mode.
    pub fn call<R>(&self, probe: impl FnOnce() -> ThreadLevel, f: impl FnOnce() -> R) -> R {
        match self.mode(probe) {
            LockMode::Serialized => {
                let _guard = self.mutex.lock();
                f()
            }
            LockMode::Unlocked => f(),
        }
    }
}
