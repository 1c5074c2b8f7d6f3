//! MPI-backed network plugin.
//!
//! Each [`MpiNet`] runs on a private duplicate of a communicator, by default
//! `MPI_COMM_WORLD`, so its traffic cannot collide with the application's own
//! messages or with another `MpiNet` in the same process. MPI must already be
//! initialized (for example through `ferrompi`) and must outlive the plugin.
//!
//! If MPI was initialized below `MPI_THREAD_MULTIPLE`, or
//! `FERRORING_MPI_FORCE_LOCK=1`, every MPI call made by this plugin is
//! serialized behind its [`BackendLock`].

use std::os::raw::{c_int, c_void};

use tracing::{debug, warn};

use super::{
    handle_for, send_context, BackendLock, ConnectionHandle, LockMode, NetPlugin, NetRequest,
    RecvContext, RequestKind, RequestPool, SendContext, TagAllocator,
};
use crate::buffer::Region;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ffi;
use crate::ThreadLevel;

/// Fortran handle of an MPI communicator, as produced by `MPI_Comm_c2f`.
///
/// MPI converts communicators to and from this form losslessly, so a
/// communicator owned by another binding can be handed to
/// [`MpiNet::with_comm`] without depending on the C `MPI_Comm` type.
pub type RawComm = i32;

/// An in-flight transfer: the heap `MPI_Request` owned by the C layer and
/// the memory MPI reads from or writes into.
struct MpiRequest {
    raw: *mut c_void,
    _buffer: Region,
}

// SAFETY: the pointer is only dereferenced by MPI calls made under the
// plugin's backend lock when the MPI thread level requires it.
unsafe impl Send for MpiRequest {}

/// Network plugin over MPI nonblocking point-to-point calls.
pub struct MpiNet {
    comm: *mut c_void,
    rank: i32,
    tags: TagAllocator,
    requests: RequestPool<MpiRequest>,
    lock: BackendLock,
}

// SAFETY: the communicator pointer is immutable after construction and every
// call through it is serialized when MPI reports less than full thread support.
unsafe impl Send for MpiNet {}
unsafe impl Sync for MpiNet {}

fn query_thread_level() -> ThreadLevel {
    let mut provided: c_int = 0;
    let ret = unsafe { ffi::ferroring_mpi_query_thread(&mut provided) };
    if ret != 0 {
        return ThreadLevel::Single;
    }
    match provided {
        0 => ThreadLevel::Single,
        1 => ThreadLevel::Funneled,
        2 => ThreadLevel::Serialized,
        _ => ThreadLevel::Multiple,
    }
}

fn ensure_initialized() -> Result<()> {
    let mut flag: c_int = 0;
    Error::check(unsafe { ffi::ferroring_mpi_initialized(&mut flag) })?;
    if flag == 0 {
        return Err(Error::NotSupported("MPI has not been initialized".into()));
    }
    Ok(())
}

/// Fold one `ferroring_mpi_test` result into `request`.
///
/// Once MPI reports the request done the C layer has freed it, so the slot is
/// released even when the byte count could not be read.
fn settle(
    requests: &RequestPool<MpiRequest>,
    request: &mut NetRequest,
    ret: c_int,
    done: c_int,
    size: c_int,
) -> Result<Option<usize>> {
    if done == 0 {
        Error::check(ret)?;
        return Ok(None);
    }
    requests.release(request.slot())?;
    request.retire();
    Error::check(ret)?;
    let bytes = usize::try_from(size).map_err(|_| Error::Internal("negative MPI count".into()))?;
    request.complete(bytes);
    Ok(Some(bytes))
}

impl MpiNet {
    /// Create a plugin on a private duplicate of `MPI_COMM_WORLD`.
    ///
    /// Collective over `MPI_COMM_WORLD`: every rank must call it.
    pub fn new() -> Result<Self> {
        MpiNet::with_config(&Config::from_env())
    }

    /// Like [`new`](Self::new) with explicit configuration.
    pub fn with_config(config: &Config) -> Result<Self> {
        ensure_initialized()?;
        MpiNet::with_comm(MpiNet::world_comm(), config)
    }

    /// Create a plugin on a private duplicate of `parent`.
    ///
    /// Collective over `parent`: every rank in it must call this. Ranks in
    /// handles are ranks in `parent`.
    pub fn with_comm(parent: RawComm, config: &Config) -> Result<Self> {
        ensure_initialized()?;
        let lock = BackendLock::new(config.force_lock);
        let mut comm: *mut c_void = std::ptr::null_mut();
        lock.call(query_thread_level, || {
            Error::check(unsafe { ffi::ferroring_mpi_comm_dup(parent, &mut comm) })
        })?;

        let mut rank: i32 = 0;
        let ret = lock.call(query_thread_level, || unsafe {
            ffi::ferroring_mpi_comm_rank(comm, &mut rank)
        });
        if ret != 0 {
            unsafe { ffi::ferroring_mpi_comm_free(comm) };
            return Err(Error::from_code(ret));
        }
        debug!(rank, parent, mode = ?lock.mode(query_thread_level), "MPI network plugin ready");

        Ok(MpiNet {
            comm,
            rank,
            tags: TagAllocator::new(),
            requests: RequestPool::new(config.request_pool_increment),
            lock,
        })
    }

    /// Handle of `MPI_COMM_WORLD`.
    pub fn world_comm() -> RawComm {
        unsafe { ffi::ferroring_mpi_comm_world_handle() }
    }

    /// Rank in the duplicated communicator.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    fn backend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.call(query_thread_level, f)
    }

    fn size_of(data: &Region) -> Result<c_int> {
        c_int::try_from(data.len()).map_err(|_| Error::InvalidBuffer)
    }

    /// Store a started transfer, keeping `data` alive with it.
    fn track(
        &self,
        slot: usize,
        ret: c_int,
        raw: *mut c_void,
        data: Region,
        kind: RequestKind,
    ) -> Result<NetRequest> {
        if ret != 0 {
            self.requests.release(slot)?;
            return Err(Error::from_code(ret));
        }
        self.requests.set(
            slot,
            MpiRequest {
                raw,
                _buffer: data,
            },
        )?;
        Ok(NetRequest::new(slot, kind))
    }
}

impl NetPlugin for MpiNet {
    fn name(&self) -> &str {
        "MPI"
    }

    fn get_handle(&self) -> Result<(ConnectionHandle, RecvContext)> {
        Ok(handle_for(self.rank, &self.tags))
    }

    fn connect_handle(&self, handle: ConnectionHandle) -> Result<SendContext> {
        Ok(send_context(&handle))
    }

    fn isend(&self, comm: &SendContext, data: Region) -> Result<NetRequest> {
        let size = Self::size_of(&data)?;
        let slot = self.requests.acquire();
        let mut raw: *mut c_void = std::ptr::null_mut();
        let ret = self.backend(|| unsafe {
            ffi::ferroring_mpi_isend(
                self.comm,
                data.as_mut_ptr().cast_const().cast::<c_void>(),
                size,
                comm.peer(),
                comm.tag(),
                &mut raw,
            )
        });
        self.track(slot, ret, raw, data, RequestKind::Send)
    }

    fn irecv(&self, comm: &RecvContext, data: Region) -> Result<NetRequest> {
        let size = Self::size_of(&data)?;
        let slot = self.requests.acquire();
        let mut raw: *mut c_void = std::ptr::null_mut();
        let ret = self.backend(|| unsafe {
            ffi::ferroring_mpi_irecv(
                self.comm,
                data.as_mut_ptr().cast::<c_void>(),
                size,
                comm.tag(),
                &mut raw,
            )
        });
        self.track(slot, ret, raw, data, RequestKind::Recv)
    }

    fn test(&self, request: &mut NetRequest) -> Result<Option<usize>> {
        if let Some(bytes) = request.bytes() {
            return Ok(Some(bytes));
        }
        if request.is_retired() {
            return Err(Error::InvalidRequest);
        }
        let raw = self.requests.with_slot(request.slot(), |r| r.raw)?;
        let mut done: c_int = 0;
        let mut size: c_int = 0;
        let ret = self.backend(|| unsafe { ffi::ferroring_mpi_test(raw, &mut done, &mut size) });
        settle(&self.requests, request, ret, done, size)
    }

    fn cancel(&self, request: &mut NetRequest) -> Result<()> {
        if request.is_retired() {
            return Ok(());
        }
        let slot = request.slot();
        let raw = self.requests.with_slot(slot, |r| r.raw)?;
        let ret = self.backend(|| unsafe { ffi::ferroring_mpi_cancel(raw) });
        let state = self.requests.release(slot)?;
        request.retire();
        if ret != 0 {
            // MPI may still write into the buffer.
            std::mem::forget(state);
            warn!(slot, code = ret, "MPI could not cancel request, buffer leaked");
            return Err(Error::from_code(ret));
        }
        debug!(slot, kind = ?request.kind(), "MPI request cancelled");
        Ok(())
    }

    fn lock_mode(&self) -> LockMode {
        self.lock.mode(query_thread_level)
    }

    fn live_requests(&self) -> usize {
        self.requests.live()
    }
}

impl Drop for MpiNet {
    fn drop(&mut self) {
        let comm = self.comm;
        self.backend(|| unsafe { ffi::ferroring_mpi_comm_free(comm) });
    }
}
