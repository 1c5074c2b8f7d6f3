//! Runtime configuration read from the process environment.
//!
//! All variables are optional. Unset or unparsable values fall back to the
//! defaults below.
//!
//! | Field | Variable | Default |
//! |-------|----------|---------|
//! | `force_lock` | `FERRORING_MPI_FORCE_LOCK` | `false` |
//! | `buff_size` | `FERRORING_BUFFSIZE` | 4 MiB |
//! | `request_pool_increment` | `FERRORING_REQUEST_POOL_INCREMENT` | 32 |
//! | `proxy_fifo_capacity` | `FERRORING_PROXY_FIFO_CAPACITY` | 16 |
//! | `proxy_idle_spins` | `FERRORING_PROXY_IDLE_SPINS` | 1000 |

use std::env;
use std::str::FromStr;

use tracing::warn;

/// Serialize every network backend call behind one lock when set to `1`.
pub const ENV_FORCE_LOCK: &str = "FERRORING_MPI_FORCE_LOCK";
/// Per-connection staging buffer size in bytes.
pub const ENV_BUFFSIZE: &str = "FERRORING_BUFFSIZE";
/// Slots added to a request pool each time it runs out.
pub const ENV_REQUEST_POOL_INCREMENT: &str = "FERRORING_REQUEST_POOL_INCREMENT";
/// Number of entries in each proxy step FIFO.
pub const ENV_PROXY_FIFO_CAPACITY: &str = "FERRORING_PROXY_FIFO_CAPACITY";
/// Idle proxy iterations before the thread yields.
pub const ENV_PROXY_IDLE_SPINS: &str = "FERRORING_PROXY_IDLE_SPINS";

/// Default staging buffer size per connection.
pub const DEFAULT_BUFFSIZE: usize = 4 << 20;
/// Default request pool growth increment.
pub const DEFAULT_REQUEST_POOL_INCREMENT: usize = 32;
/// Default proxy FIFO capacity.
pub const DEFAULT_PROXY_FIFO_CAPACITY: usize = 16;
/// Default idle spins before yielding.
pub const DEFAULT_PROXY_IDLE_SPINS: u32 = 1000;

/// Tunables shared by the network plugins, transports and proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Serialize all backend calls regardless of the reported thread level.
    pub force_lock: bool,
    /// Bytes of staging memory per connector.
    pub buff_size: usize,
    /// Request pool growth increment.
    pub request_pool_increment: usize,
    /// Proxy FIFO capacity, always a power of two.
    pub proxy_fifo_capacity: usize,
    /// Idle proxy iterations before yielding the CPU.
    pub proxy_idle_spins: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            force_lock: false,
            buff_size: DEFAULT_BUFFSIZE,
            request_pool_increment: DEFAULT_REQUEST_POOL_INCREMENT,
            proxy_fifo_capacity: DEFAULT_PROXY_FIFO_CAPACITY,
            proxy_idle_spins: DEFAULT_PROXY_IDLE_SPINS,
        }
    }
}

impl Config {
    /// Build a configuration from the environment, starting from the defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            force_lock: force_lock(),
            buff_size: positive_var(ENV_BUFFSIZE).unwrap_or(defaults.buff_size),
            request_pool_increment: positive_var(ENV_REQUEST_POOL_INCREMENT)
                .unwrap_or(defaults.request_pool_increment),
            proxy_fifo_capacity: positive_var::<usize>(ENV_PROXY_FIFO_CAPACITY)
                .map_or(defaults.proxy_fifo_capacity, usize::next_power_of_two),
            proxy_idle_spins: parse_var(ENV_PROXY_IDLE_SPINS).unwrap_or(defaults.proxy_idle_spins),
        }
    }
}

/// Whether the force-lock override is set.
///
/// Only the exact value `1` enables it.
pub fn force_lock() -> bool {
    parse_var::<i64>(ENV_FORCE_LOCK) == Some(1)
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn positive_var<T: FromStr + PartialOrd + Default>(name: &str) -> Option<T> {
    parse_var(name).filter(|v: &T| *v > T::default())
}
