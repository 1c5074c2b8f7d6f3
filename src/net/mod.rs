//! Network plugin interface.
//!
//! A network plugin moves opaque byte ranges between ranks with five
//! operations:
//!
//! | Operation | Side | Effect |
//! |-----------|------|--------|
//! | [`get_handle`](NetPlugin::get_handle) | receiver | allocate a tag, produce a handle and a [`RecvContext`] |
//! | [`connect_handle`](NetPlugin::connect_handle) | sender | turn the peer's handle into a [`SendContext`] |
//! | [`isend`](NetPlugin::isend) | sender | start a nonblocking send |
//! | [`irecv`](NetPlugin::irecv) | receiver | start a nonblocking receive, any source, matching tag |
//! | [`test`](NetPlugin::test) | either | poll for completion, release the request slot when done |
//!
//! Requests abandoned before completion, for example when a proxy is
//! destroyed with receives still posted, are withdrawn with
//! [`cancel`](NetPlugin::cancel) so their slots and buffers are released.
//!
//! The handle is exchanged out of band (bootstrap is outside this crate).
//! Each backend instance owns its tag allocator, request pool and backend
//! lock, so independent communicators in one process share nothing.

mod lock;
pub mod loopback;
#[cfg(feature = "mpi")]
pub mod mpi;
mod pool;
mod request;
mod tag;

pub use lock::{BackendLock, LockMode};
pub use pool::RequestPool;
pub use request::{NetRequest, RequestKind};
pub use tag::{Tag, TagAllocator, FIRST_TAG};

use crate::buffer::Region;
use crate::error::{Error, Result};

/// Size of a serialized [`ConnectionHandle`].
pub const NET_HANDLE_MAXSIZE: usize = 128;

// Rank and tag, as two little-endian i32 values.
const HANDLE_PAYLOAD: usize = 8;
const _: () = assert!(HANDLE_PAYLOAD < NET_HANDLE_MAXSIZE);

/// Opaque address of a receive endpoint, exchanged out of band.
///
/// Produced by [`NetPlugin::get_handle`] and consumed by value by
/// [`NetPlugin::connect_handle`], so a handle connects at most once.
pub struct ConnectionHandle {
    bytes: [u8; NET_HANDLE_MAXSIZE],
}

impl ConnectionHandle {
    /// Handle addressing `tag` on `rank`.
    pub fn new(rank: i32, tag: Tag) -> Self {
        let mut bytes = [0u8; NET_HANDLE_MAXSIZE];
        bytes[..4].copy_from_slice(&rank.to_le_bytes());
        bytes[4..HANDLE_PAYLOAD].copy_from_slice(&tag.to_le_bytes());
        ConnectionHandle { bytes }
    }

    /// Rebuild a handle from bytes received from a peer.
    ///
    /// The layout is not versioned; both ends must run the same build.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; NET_HANDLE_MAXSIZE] =
            bytes.try_into().map_err(|_| Error::InvalidHandle)?;
        Ok(ConnectionHandle { bytes })
    }

    /// Serialized form.
    pub fn as_bytes(&self) -> &[u8; NET_HANDLE_MAXSIZE] {
        &self.bytes
    }

    /// Rank of the receiving process.
    pub fn rank(&self) -> i32 {
        i32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// Tag of the receive endpoint.
    pub fn tag(&self) -> Tag {
        i32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("rank", &self.rank())
            .field("tag", &self.tag())
            .finish()
    }
}

/// Sender half of a connection: where to send and with which tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendContext {
    peer: i32,
    tag: Tag,
}

impl SendContext {
    /// Destination rank.
    pub fn peer(&self) -> i32 {
        self.peer
    }

    /// Tag every send on this connection carries.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

/// Receiver half of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvContext {
    rank: i32,
    tag: Tag,
}

impl RecvContext {
    /// Rank that owns this endpoint.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Tag receives on this connection match.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

/// A point-to-point network backend.
///
/// Implementations must be callable from several proxy threads at once;
/// backends that cannot run calls concurrently serialize them through a
/// [`BackendLock`].
pub trait NetPlugin: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Allocate a receive endpoint and the handle that addresses it.
    fn get_handle(&self) -> Result<(ConnectionHandle, RecvContext)>;

    /// Build the sender half from the peer's handle.
    fn connect_handle(&self, handle: ConnectionHandle) -> Result<SendContext>;

    /// Start sending `data` to the connection's peer.
    fn isend(&self, comm: &SendContext, data: Region) -> Result<NetRequest>;

    /// Start receiving into `data` from any source on the connection's tag.
    fn irecv(&self, comm: &RecvContext, data: Region) -> Result<NetRequest>;

    /// Poll `request`; `Some(bytes)` once complete.
    ///
    /// Safe to call again after completion. Once `test` has returned an
    /// error for a request, further polls fail with
    /// [`Error::InvalidRequest`].
    fn test(&self, request: &mut NetRequest) -> Result<Option<usize>>;

    /// Withdraw a request that has not completed and release its slot.
    ///
    /// When this returns the backend no longer reads or writes the
    /// request's buffer. Data a cancelled receive may already have matched
    /// is dropped. Does nothing for requests that are already retired.
    fn cancel(&self, request: &mut NetRequest) -> Result<()>;

    /// Lock mode in effect for this backend.
    fn lock_mode(&self) -> LockMode;

    /// Request slots currently held by in-flight operations.
    fn live_requests(&self) -> usize;
}

/// Connection halves shared by every backend that addresses peers by
/// `{rank, tag}`.
pub(crate) fn handle_for(rank: i32, tags: &TagAllocator) -> (ConnectionHandle, RecvContext) {
    let tag = tags.next();
    (ConnectionHandle::new(rank, tag), RecvContext { rank, tag })
}

pub(crate) fn send_context(handle: &ConnectionHandle) -> SendContext {
    SendContext {
        peer: handle.rank(),
        tag: handle.tag(),
    }
}
