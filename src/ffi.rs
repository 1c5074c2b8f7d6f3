//! Raw FFI bindings to the C wrapper layer.
//!
//! These are low-level unsafe functions. Use [`crate::net::mpi::MpiNet`] instead.

#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_void};

// Type aliases matching the C header
pub type int32_t = i32;

extern "C" {
    // ============================================================
    // Environment
    // ============================================================

    pub fn ferroring_mpi_initialized(flag: *mut c_int) -> c_int;
    #[cfg(test)]
    pub fn ferroring_mpi_init_multiple(provided: *mut c_int) -> c_int;
    pub fn ferroring_mpi_query_thread(provided: *mut c_int) -> c_int;

    // ============================================================
    // Communicator
    // ============================================================

    pub fn ferroring_mpi_comm_world_handle() -> int32_t;
    pub fn ferroring_mpi_comm_dup(parent: int32_t, comm: *mut *mut c_void) -> c_int;
    pub fn ferroring_mpi_comm_free(comm: *mut c_void) -> c_int;
    pub fn ferroring_mpi_comm_rank(comm: *mut c_void, rank: *mut int32_t) -> c_int;

    // ============================================================
    // Nonblocking byte transfers
    // ============================================================

    pub fn ferroring_mpi_isend(
        comm: *mut c_void,
        buf: *const c_void,
        size: c_int,
        dest: int32_t,
        tag: int32_t,
        request: *mut *mut c_void,
    ) -> c_int;

    pub fn ferroring_mpi_irecv(
        comm: *mut c_void,
        buf: *mut c_void,
        size: c_int,
        tag: int32_t,
        request: *mut *mut c_void,
    ) -> c_int;

    pub fn ferroring_mpi_test(request: *mut c_void, done: *mut c_int, size: *mut c_int) -> c_int;
    pub fn ferroring_mpi_cancel(request: *mut c_void) -> c_int;
}
