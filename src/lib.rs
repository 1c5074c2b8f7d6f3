//! # ferroring
//!
//! Transport and data-movement core for ring collectives.
//!
//! This crate moves data between ranks arranged in a ring and combines it in
//! flight. It provides:
//! - A pluggable point-to-point network interface ([`net::NetPlugin`]) with an
//!   in-process loopback backend and an MPI backend (with `mpi` feature)
//! - A transport abstraction ([`transport::Transport`]) with a network
//!   transport built on the plugin interface
//! - Proxy threads fed through bounded step FIFOs ([`proxy::Proxy`])
//! - Ring descriptions and pattern encoding ([`ring`], [`pattern`])
//! - A vectorized, alignment-aware reduce/copy engine ([`reduce_copy`])
//!
//! ## Supported Types
//!
//! The reduce/copy engine is generic over [`Element`]:
//! `i8`, `u8`, `i32`, `u32`, `i64`, `u64`, [`half::f16`], `f32`, `f64`
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use ferroring::buffer::{Region, SharedBuffer};
//! use ferroring::net::{loopback::LoopbackFabric, NetPlugin};
//!
//! fn main() -> Result<(), ferroring::Error> {
//!     let fabric = LoopbackFabric::new(2);
//!     let (rank0, rank1) = (fabric.endpoint(0)?, fabric.endpoint(1)?);
//!
//!     // Rank 1 publishes a handle out of band; rank 0 connects to it.
//!     let (handle, recv_comm) = rank1.get_handle()?;
//!     let send_comm = rank0.connect_handle(handle)?;
//!
//!     let src = Arc::new(SharedBuffer::new(64));
//!     src.write(0, b"ring")?;
//!     let dst = Arc::new(SharedBuffer::new(64));
//!
//!     let mut recv = rank1.irecv(&recv_comm, Region::whole(Arc::clone(&dst)))?;
//!     let mut send = rank0.isend(&send_comm, Region::new(src, 0..4)?)?;
//!     while rank0.test(&mut send)?.is_none() {}
//!     let mut received = None;
//!     while received.is_none() {
//!         received = rank1.test(&mut recv)?;
//!     }
//!     assert_eq!(received, Some(4));
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi`   | MPI network plugin over a C shim | `cc`, `pkg-config` (build) |
//!
//! ## Configuration
//!
//! Tunables are read from `FERRORING_*` environment variables; see [`Config`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod buffer;
pub mod config;
mod datatype;
mod error;
#[cfg(feature = "mpi")]
mod ffi;
pub mod net;
pub mod pattern;
pub mod proxy;
pub mod reduce;
pub mod reduce_copy;
pub mod ring;
pub mod spin;
pub mod transport;

pub use config::Config;
pub use datatype::{Element, ElementTag};
pub use error::{Error, Result};
pub use pattern::RingPattern;
pub use proxy::{Proxy, ProxyArgs, ProxyState};
pub use reduce_copy::{copy_slices, reduce_slices, Operands};
pub use ring::{save_proxies, RingConnections, RingInfo, StepPlan};
pub use transport::{select_transport, Direction, Transport, TransportComm};

/// Thread support level reported by a network backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but backend calls only from the main thread
    Funneled = 1,
    /// Multi-threaded, but backend calls serialized by the caller
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_levels_are_ordered() {
        assert!(ThreadLevel::Single < ThreadLevel::Funneled);
        assert!(ThreadLevel::Serialized < ThreadLevel::Multiple);
        assert_eq!(ThreadLevel::Multiple as i32, 3);
        assert_eq!(ReduceOp::Prod as i32, 3);
    }
}
