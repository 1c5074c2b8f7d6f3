//! Error types for ferroring

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for transport, proxy and network plugin operations
#[derive(Error, Debug)]
pub enum Error {
    /// Non-zero status from the underlying network backend, passed through verbatim
    #[error("Network backend error (code {0})")]
    Backend(i32),

    /// Buffer too small or lengths inconsistent
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Request handle does not refer to a live pool slot
    #[error("Invalid request handle")]
    InvalidRequest,

    /// Connection handle bytes could not be decoded
    #[error("Invalid connection handle")]
    InvalidHandle,

    /// A receive matched a message larger than the posted buffer
    #[error("Message truncated: {received} bytes received into a {capacity} byte buffer")]
    Truncated {
        /// Size of the posted receive buffer
        capacity: usize,
        /// Size of the matched message
        received: usize,
    },

    /// Operation not supported by this backend or build
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// No transport could connect this rank to `peer`
    #[error("No transport can connect to rank {peer}")]
    NoTransport {
        /// The peer rank that could not be reached
        peer: i32,
    },

    /// Transport resources were used before `setup`/`connect` completed
    #[error("Connector is not connected")]
    NotConnected,

    /// The proxy FIFO was closed; no further work is accepted
    #[error("Proxy has been stopped")]
    ProxyStopped,

    /// A proxy thread terminated with an error
    #[error("Proxy {proxy} failed: {reason}")]
    ProxyFailed {
        /// Name of the failed proxy
        proxy: String,
        /// Rendered error that terminated the proxy
        reason: String,
    },

    /// Connection was aborted while work was in flight
    #[error("Connection aborted")]
    Aborted,

    /// Ring root index does not fit the integer pattern encoding
    #[error("Ring root {0} does not fit the pattern encoding")]
    PatternOutOfRange(usize),

    /// A ring description does not contain the local rank
    #[error("Rank {rank} is not a member of ring {ring}")]
    NotInRing {
        /// Local rank
        rank: i32,
        /// Ring id
        ring: usize,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an error from a backend status code.
    ///
    /// Panics on the success code (0); use [`Error::check`] for raw codes.
    pub fn from_code(code: i32) -> Self {
        assert_ne!(code, 0, "from_code called with success code");
        Error::Backend(code)
    }

    /// Check a backend return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }
}
