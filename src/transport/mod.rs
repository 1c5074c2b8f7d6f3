//! Transport abstraction.
//!
//! A [`Transport`] knows how to connect two ranks over one kind of link. For
//! each direction it provides a [`TransportComm`] with four operations:
//! `setup` produces the [`ConnectBlob`] sent to the peer, `connect` consumes
//! the peer's blob, `free` releases what setup and connect allocated, and
//! `proxy` drives one multi-step transfer from the connection's
//! [`Proxy`](crate::proxy::Proxy) thread.
//!
//! Transports publish a fixed-size [`TransportInfo`] for every rank; pairs of
//! infos decide whether a transport can link two ranks
//! ([`select_transport`]).

mod mem;
pub mod net;

pub use mem::{ConnectorMem, StepConsumer, StepProducer};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::net::{RecvContext, SendContext};
use crate::proxy::ProxyArgs;
use crate::ring::RingInfo;

/// Size of a [`TransportInfo`] blob.
pub const RANK_INFO_SIZE: usize = 64;

/// Size of a [`ConnectBlob`].
pub const CONNECT_SIZE: usize = 128;

const _: () = assert!(crate::net::NET_HANDLE_MAXSIZE <= CONNECT_SIZE);

macro_rules! fixed_blob {
    ($name:ident, $size:expr) => {
        impl $name {
            /// All-zero blob.
            pub fn zeroed() -> Self {
                $name { bytes: [0; $size] }
            }

            /// Blob whose leading bytes are `payload`.
            ///
            /// # Panics
            ///
            /// Panics if `payload` does not fit; both ends must agree on
            /// layouts at build time.
            pub fn from_payload(payload: &[u8]) -> Self {
                assert!(
                    payload.len() <= $size,
                    concat!(stringify!($name), " payload too large")
                );
                let mut bytes = [0; $size];
                bytes[..payload.len()].copy_from_slice(payload);
                $name { bytes }
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.bytes
            }

            /// Little-endian i32 at byte `offset`.
            pub fn read_i32(&self, offset: usize) -> i32 {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.bytes[offset..offset + 4]);
                i32::from_le_bytes(raw)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let used = self.bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                f.debug_struct(stringify!($name))
                    .field("payload", &&self.bytes[..used])
                    .finish()
            }
        }
    };
}

/// Per-rank capability info, private to the transport that filled it.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportInfo {
    bytes: [u8; RANK_INFO_SIZE],
}

fixed_blob!(TransportInfo, RANK_INFO_SIZE);

/// Handshake produced by `setup` on one side and consumed by `connect` on the
/// other. Not versioned.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectBlob {
    bytes: [u8; CONNECT_SIZE],
}

fixed_blob!(ConnectBlob, CONNECT_SIZE);

/// Which half of a ring link a connector is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sends to the next rank.
    Send,
    /// Receives from the previous rank.
    Recv,
}

/// Transport-owned state attached to a connector by `setup`/`connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResources {
    /// Network plugin sender half.
    NetSend(SendContext),
    /// Network plugin receiver half.
    NetRecv(RecvContext),
}

/// One end of a ring link: staging memory, transport state and proxy
/// bookkeeping.
#[derive(Debug)]
pub struct Connector {
    direction: Direction,
    ring: RingInfo,
    mem: Arc<ConnectorMem>,
    resources: Mutex<Option<TransportResources>>,
    abort: AtomicBool,
    proxy_step: AtomicU64,
}

impl Connector {
    /// Connector with fresh staging memory.
    pub fn new(direction: Direction, ring: RingInfo, mem: ConnectorMem) -> Self {
        Connector {
            direction,
            ring,
            mem: Arc::new(mem),
            resources: Mutex::new(None),
            abort: AtomicBool::new(false),
            proxy_step: AtomicU64::new(0),
        }
    }

    /// Direction of this connector.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Ring this connector belongs to.
    pub fn ring(&self) -> &RingInfo {
        &self.ring
    }

    /// The rank at the other end.
    pub fn peer(&self) -> i32 {
        match self.direction {
            Direction::Send => self.ring.next(),
            Direction::Recv => self.ring.prev(),
        }
    }

    /// Staging memory shared with the device side.
    pub fn mem(&self) -> &Arc<ConnectorMem> {
        &self.mem
    }

    /// Attach transport state.
    pub fn set_resources(&self, resources: TransportResources) {
        *self.resources.lock() = Some(resources);
    }

    /// Transport state, or `NotConnected` before connect.
    pub fn resources(&self) -> Result<TransportResources> {
        self.resources.lock().clone().ok_or(Error::NotConnected)
    }

    /// Detach and return transport state.
    pub fn take_resources(&self) -> Option<TransportResources> {
        self.resources.lock().take()
    }

    /// Ask in-flight proxy work on this connector to stop.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Whether [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// First step of the next proxy operation. Cumulative across operations.
    pub fn proxy_step(&self) -> u64 {
        self.proxy_step.load(Ordering::Acquire)
    }

    /// Record that the proxy finished `nsteps` more steps.
    pub fn advance_proxy_step(&self, nsteps: u64) {
        self.proxy_step.fetch_add(nsteps, Ordering::AcqRel);
    }
}

/// Per-direction connection operations.
pub trait TransportComm: Send + Sync {
    /// Negotiate with the peer's info and produce the blob it will connect with.
    fn setup(
        &self,
        local: &TransportInfo,
        remote: &TransportInfo,
        connector: &Connector,
    ) -> Result<ConnectBlob>;

    /// Finish the connection from the peer's blob.
    fn connect(&self, blob: &ConnectBlob, connector: &Connector) -> Result<()>;

    /// Release resources owned by `connector`.
    fn free(&self, connector: &Connector) -> Result<()>;

    /// Drive one multi-step transfer to completion.
    fn proxy(&self, args: &ProxyArgs) -> Result<()>;
}

/// A kind of link between ranks.
pub trait Transport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// This rank's capability info.
    fn fill_info(&self, rank: i32) -> Result<TransportInfo>;

    /// Whether this transport can link the ranks that published `local` and `remote`.
    fn can_connect(&self, local: &TransportInfo, remote: &TransportInfo) -> bool;

    /// Rings this transport can form over the ranks that published `infos`,
    /// each as a list of ranks in ring order.
    fn get_rings(&self, infos: &[TransportInfo]) -> Vec<Vec<i32>> {
        vec![(0..infos.len() as i32).collect()]
    }

    /// Sender-side operations.
    fn send_comm(&self) -> Arc<dyn TransportComm>;

    /// Receiver-side operations.
    fn recv_comm(&self) -> Arc<dyn TransportComm>;
}

/// Pick the first transport in priority order that can link this rank to `peer`.
///
/// `local[i]` and `remote[i]` are the infos filled by `transports[i]`.
pub fn select_transport<'a>(
    transports: &'a [Arc<dyn Transport>],
    local: &[TransportInfo],
    remote: &[TransportInfo],
    peer: i32,
) -> Result<&'a Arc<dyn Transport>> {
    let found = transports
        .iter()
        .zip(local.iter().zip(remote))
        .find(|(transport, (l, r))| transport.can_connect(l, r))
        .map(|(transport, _)| transport);
    match found {
        Some(transport) => {
            debug!(peer, transport = transport.name(), "transport selected");
            Ok(transport)
        }
        None => Err(Error::NoTransport { peer }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Picky {
        name: &'static str,
        accepts: u8,
    }

    struct Idle;

    impl TransportComm for Idle {
        fn setup(&self, _: &TransportInfo, _: &TransportInfo, _: &Connector) -> Result<ConnectBlob> {
            Ok(ConnectBlob::zeroed())
        }
        fn connect(&self, _: &ConnectBlob, _: &Connector) -> Result<()> {
            Ok(())
        }
        fn free(&self, _: &Connector) -> Result<()> {
            Ok(())
        }
        fn proxy(&self, _: &ProxyArgs) -> Result<()> {
            Ok(())
        }
    }

    impl Transport for Picky {
        fn name(&self) -> &str {
            self.name
        }
        fn fill_info(&self, _rank: i32) -> Result<TransportInfo> {
            Ok(TransportInfo::from_payload(&[self.accepts]))
        }
        fn can_connect(&self, _local: &TransportInfo, remote: &TransportInfo) -> bool {
            remote.as_bytes()[0] == 1
        }
        fn send_comm(&self) -> Arc<dyn TransportComm> {
            Arc::new(Idle)
        }
        fn recv_comm(&self) -> Arc<dyn TransportComm> {
            Arc::new(Idle)
        }
    }

    #[test]
    fn first_capable_transport_wins() {
        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(Picky { name: "shm", accepts: 0 }),
            Arc::new(Picky { name: "net", accepts: 1 }),
            Arc::new(Picky { name: "p2p", accepts: 1 }),
        ];
        let infos: Vec<_> = transports.iter().map(|t| t.fill_info(0).unwrap()).collect();
        let chosen = select_transport(&transports, &infos, &infos, 1).unwrap();
        assert_eq!(chosen.name(), "net");
    }

    #[test]
    fn no_capable_transport() {
        let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(Picky { name: "shm", accepts: 0 })];
        let infos = vec![transports[0].fill_info(0).unwrap()];
        assert!(matches!(
            select_transport(&transports, &infos, &infos, 5),
            Err(Error::NoTransport { peer: 5 })
        ));
        assert_eq!(transports[0].get_rings(&[infos[0].clone(), infos[0].clone()]), vec![vec![0, 1]]);
    }

    #[test]
    fn blobs() {
        let blob = ConnectBlob::from_payload(&7i32.to_le_bytes());
        assert_eq!(blob.read_i32(0), 7);
        assert_eq!(blob.as_bytes().len(), CONNECT_SIZE);
        assert_eq!(format!("{blob:?}"), "ConnectBlob { payload: [7] }");
    }

    #[test]
    #[should_panic(expected = "TransportInfo payload too large")]
    fn oversized_info_is_fatal() {
        TransportInfo::from_payload(&[0; RANK_INFO_SIZE + 1]);
    }

    #[test]
    fn connector_resources_and_abort() {
        let ring = RingInfo::new(0, &[0, 1, 2], 1, 256).unwrap();
        let connector = Connector::new(Direction::Recv, ring, ConnectorMem::new(256, 4).unwrap());
        assert_eq!(connector.peer(), 0);
        assert!(matches!(connector.resources(), Err(Error::NotConnected)));
        connector.advance_proxy_step(3);
        assert_eq!(connector.proxy_step(), 3);
        assert!(!connector.is_aborted());
        connector.abort();
        assert!(connector.is_aborted());
    }
}
