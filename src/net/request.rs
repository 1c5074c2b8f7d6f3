//! Handles for in-flight network operations.

/// Direction of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Issued by [`NetPlugin::isend`](super::NetPlugin::isend).
    Send,
    /// Issued by [`NetPlugin::irecv`](super::NetPlugin::irecv).
    Recv,
}

/// A handle to one asynchronous send or receive.
///
/// The handle names a slot in the issuing backend's request pool. Poll it
/// with [`NetPlugin::test`](super::NetPlugin::test) until it reports
/// completion; the slot is released the first time completion is observed,
/// and later polls return the recorded byte count without touching the pool.
///
/// A request must be polled to completion, or cancelled with
/// [`NetPlugin::cancel`](super::NetPlugin::cancel), before the memory it
/// refers to is reused.
#[derive(Debug)]
pub struct NetRequest {
    slot: usize,
    kind: RequestKind,
    completed: Option<usize>,
    retired: bool,
}

impl NetRequest {
    /// Create a new request for pool slot `slot`.
    pub(crate) fn new(slot: usize, kind: RequestKind) -> Self {
        NetRequest {
            slot,
            kind,
            completed: None,
            retired: false,
        }
    }

    /// Pool slot backing this request (for advanced use).
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Send or receive.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Check if this request has been completed.
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Bytes transferred, once complete.
    pub fn bytes(&self) -> Option<usize> {
        self.completed
    }

    /// Whether the backend has released this request's slot, through
    /// completion, failure or cancellation.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn complete(&mut self, bytes: usize) {
        self.completed = Some(bytes);
        self.retired = true;
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }
}
