//! In-process message-passing backend.
//!
//! A [`LoopbackFabric`] connects `world_size` endpoints living in one process,
//! typically one per thread standing in for a rank. Matching follows MPI
//! point-to-point rules: sends address `{rank, tag}`, receives match any source
//! on their tag, and messages with the same destination and tag are matched
//! in the order they were sent against receives in the order they were
//! posted. Sends are eager: the payload is copied out when the send is
//! issued, so the send completes on its first poll.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{
    handle_for, send_context, BackendLock, ConnectionHandle, LockMode, NetPlugin, NetRequest,
    RecvContext, RequestKind, RequestPool, SendContext, Tag, TagAllocator,
};
use crate::buffer::Region;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ThreadLevel;

/// Status code returned for an out-of-range destination rank.
pub const ERR_RANK: i32 = 6;

/// Shared medium connecting the endpoints of one simulated job.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

struct Fabric {
    world_size: usize,
    thread_level: ThreadLevel,
    mailboxes: Mutex<HashMap<(usize, Tag), Mailbox>>,
}

#[derive(Default)]
struct Mailbox {
    unexpected: VecDeque<Vec<u8>>,
    posted: VecDeque<Arc<PendingRecv>>,
}

struct PendingRecv {
    mailbox: (usize, Tag),
    region: Region,
    outcome: Mutex<Option<RecvOutcome>>,
}

#[derive(Debug, Clone, Copy)]
enum RecvOutcome {
    Done(usize),
    Truncated { capacity: usize, received: usize },
}

impl PendingRecv {
    fn deliver(&self, payload: &[u8]) {
        let fits = payload.len() <= self.region.len() && self.region.write(payload).is_ok();
        let outcome = if fits {
            RecvOutcome::Done(payload.len())
        } else {
            RecvOutcome::Truncated {
                capacity: self.region.len(),
                received: payload.len(),
            }
        };
        *self.outcome.lock() = Some(outcome);
    }
}

impl LoopbackFabric {
    /// Fabric whose backend reports full multi-threaded support.
    pub fn new(world_size: usize) -> Self {
        LoopbackFabric::with_thread_level(world_size, ThreadLevel::Multiple)
    }

    /// Fabric whose backend reports `thread_level`.
    pub fn with_thread_level(world_size: usize, thread_level: ThreadLevel) -> Self {
        LoopbackFabric {
            inner: Arc::new(Fabric {
                world_size,
                thread_level,
                mailboxes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of endpoints.
    pub fn world_size(&self) -> usize {
        self.inner.world_size
    }

    /// Endpoint for `rank` with default configuration.
    pub fn endpoint(&self, rank: usize) -> Result<LoopbackNet> {
        self.endpoint_with_config(rank, &Config::default())
    }

    /// Endpoint for `rank`.
    pub fn endpoint_with_config(&self, rank: usize, config: &Config) -> Result<LoopbackNet> {
        if rank >= self.inner.world_size {
            return Err(Error::Backend(ERR_RANK));
        }
        Ok(LoopbackNet {
            fabric: Arc::clone(&self.inner),
            rank,
            tags: TagAllocator::new(),
            requests: RequestPool::new(config.request_pool_increment),
            lock: BackendLock::new(config.force_lock),
        })
    }
}

enum LoopbackRequest {
    Send { len: usize },
    Recv(Arc<PendingRecv>),
}

/// One rank's view of a [`LoopbackFabric`].
pub struct LoopbackNet {
    fabric: Arc<Fabric>,
    rank: usize,
    tags: TagAllocator,
    requests: RequestPool<LoopbackRequest>,
    lock: BackendLock,
}

impl LoopbackNet {
    /// Rank of this endpoint.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Slots in this endpoint's request pool, used or free.
    pub fn request_capacity(&self) -> usize {
        self.requests.capacity()
    }

    fn backend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.call(|| self.fabric.thread_level, f)
    }

    fn issue(
        &self,
        kind: RequestKind,
        f: impl FnOnce() -> Result<LoopbackRequest>,
    ) -> Result<NetRequest> {
        let slot = self.requests.acquire();
        match self.backend(f) {
            Ok(state) => {
                self.requests.set(slot, state)?;
                Ok(NetRequest::new(slot, kind))
            }
            Err(err) => {
                self.requests.release(slot)?;
                Err(err)
            }
        }
    }
}

impl NetPlugin for LoopbackNet {
    fn name(&self) -> &str {
        "Loopback"
    }

    fn get_handle(&self) -> Result<(ConnectionHandle, RecvContext)> {
        Ok(handle_for(self.rank as i32, &self.tags))
    }

    fn connect_handle(&self, handle: ConnectionHandle) -> Result<SendContext> {
        Ok(send_context(&handle))
    }

    fn isend(&self, comm: &SendContext, data: Region) -> Result<NetRequest> {
        let peer = usize::try_from(comm.peer())
            .ok()
            .filter(|&p| p < self.fabric.world_size)
            .ok_or(Error::Backend(ERR_RANK))?;
        self.issue(RequestKind::Send, || {
            let payload = data.to_vec()?;
            let len = payload.len();
            let mut mailboxes = self.fabric.mailboxes.lock();
            let mailbox = mailboxes.entry((peer, comm.tag())).or_default();
            match mailbox.posted.pop_front() {
                Some(pending) => pending.deliver(&payload),
                None => mailbox.unexpected.push_back(payload),
            }
            trace!(from = self.rank, to = peer, tag = comm.tag(), len, "loopback send");
            Ok(LoopbackRequest::Send { len })
        })
    }

    fn irecv(&self, comm: &RecvContext, data: Region) -> Result<NetRequest> {
        self.issue(RequestKind::Recv, || {
            let pending = Arc::new(PendingRecv {
                mailbox: (self.rank, comm.tag()),
                region: data,
                outcome: Mutex::new(None),
            });
            let mut mailboxes = self.fabric.mailboxes.lock();
            let mailbox = mailboxes.entry(pending.mailbox).or_default();
            match mailbox.unexpected.pop_front() {
                Some(payload) => pending.deliver(&payload),
                None => mailbox.posted.push_back(Arc::clone(&pending)),
            }
            Ok(LoopbackRequest::Recv(pending))
        })
    }

    fn test(&self, request: &mut NetRequest) -> Result<Option<usize>> {
        if let Some(bytes) = request.bytes() {
            return Ok(Some(bytes));
        }
        if request.is_retired() {
            return Err(Error::InvalidRequest);
        }
        let slot = request.slot();
        let outcome = self.backend(|| {
            self.requests.with_slot(slot, |state| match state {
                LoopbackRequest::Send { len } => Some(RecvOutcome::Done(*len)),
                LoopbackRequest::Recv(pending) => *pending.outcome.lock(),
            })
        })?;

        match outcome {
            None => Ok(None),
            Some(RecvOutcome::Done(bytes)) => {
                self.requests.release(slot)?;
                request.complete(bytes);
                Ok(Some(bytes))
            }
            Some(RecvOutcome::Truncated { capacity, received }) => {
                self.requests.release(slot)?;
                request.retire();
                Err(Error::Truncated { capacity, received })
            }
        }
    }

    fn cancel(&self, request: &mut NetRequest) -> Result<()> {
        if request.is_retired() {
            return Ok(());
        }
        let slot = request.slot();
        self.backend(|| {
            let pending = self.requests.with_slot(slot, |state| match state {
                LoopbackRequest::Recv(pending) => Some(Arc::clone(pending)),
                LoopbackRequest::Send { .. } => None,
            })?;
            // Unlink first so no send can match the receive once its slot is free.
            if let Some(pending) = pending {
                let mut mailboxes = self.fabric.mailboxes.lock();
                if let Some(mailbox) = mailboxes.get_mut(&pending.mailbox) {
                    mailbox.posted.retain(|posted| !Arc::ptr_eq(posted, &pending));
                }
            }
            self.requests.release(slot)
        })?;
        request.retire();
        trace!(rank = self.rank, slot, kind = ?request.kind(), "loopback request cancelled");
        Ok(())
    }

    fn lock_mode(&self) -> LockMode {
        self.lock.mode(|| self.fabric.thread_level)
    }

    fn live_requests(&self) -> usize {
        self.requests.live()
    }
}
