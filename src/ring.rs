//! Ring links and the proxies that drive them.
//!
//! A [`RingConnections`] owns one rank's two links in one ring: the send
//! connector to its successor and the receive connector from its
//! predecessor, each with the transport chosen for it and, once started, a
//! proxy thread. [`save_proxies`] turns one collective operation into step
//! counts and queues them on every proxy the operation's pattern needs.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pattern::RingPattern;
use crate::proxy::{Proxy, ProxyArgs};
use crate::reduce::PACK_BYTES;
use crate::transport::{
    ConnectBlob, Connector, ConnectorMem, Direction, Transport, TransportComm, TransportInfo,
};

/// One rank's view of a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingInfo {
    id: usize,
    user_ranks: Vec<i32>,
    buff_size: usize,
}

impl RingInfo {
    /// Ring `id` visiting `order`, seen from `rank`.
    ///
    /// The stored order is rotated so this rank comes first: index 1 is the
    /// next rank and the last index the previous one.
    pub fn new(id: usize, order: &[i32], rank: i32, buff_size: usize) -> Result<Self> {
        let pos = order
            .iter()
            .position(|&r| r == rank)
            .ok_or(Error::NotInRing { rank, ring: id })?;
        let user_ranks = order[pos..].iter().chain(&order[..pos]).copied().collect();
        Ok(RingInfo {
            id,
            user_ranks,
            buff_size,
        })
    }

    /// Ring id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// This rank.
    pub fn rank(&self) -> i32 {
        self.user_ranks[0]
    }

    /// Successor, the destination of the send connector.
    pub fn next(&self) -> i32 {
        self.user_ranks[1 % self.user_ranks.len()]
    }

    /// Predecessor, the source of the receive connector.
    pub fn prev(&self) -> i32 {
        self.user_ranks[self.user_ranks.len() - 1]
    }

    /// Ranks in ring order starting with this one.
    pub fn user_ranks(&self) -> &[i32] {
        &self.user_ranks
    }

    /// Number of ranks in the ring.
    pub fn nranks(&self) -> usize {
        self.user_ranks.len()
    }

    /// Staging bytes per connector.
    pub fn buff_size(&self) -> usize {
        self.buff_size
    }
}

/// How a collective splits its data into proxy steps.
///
/// Each connector buffer is cut into `subchunks` chunks of `substeps` slots.
/// A round moves one chunk per block; each step moves one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    /// Slots per chunk, also the in-flight limit for the proxy.
    pub substeps: usize,
    /// Chunks per buffer.
    pub subchunks: usize,
    /// Steps of the algorithm per round.
    pub steps_per_round: usize,
    /// Blocks sharing each round.
    pub blocks_per_round: usize,
}

impl StepPlan {
    /// # Panics
    ///
    /// Panics if any factor is zero.
    pub fn new(
        substeps: usize,
        subchunks: usize,
        steps_per_round: usize,
        blocks_per_round: usize,
    ) -> Self {
        assert!(
            substeps > 0 && subchunks > 0 && steps_per_round > 0 && blocks_per_round > 0,
            "step plan factors must be non-zero"
        );
        StepPlan {
            substeps,
            subchunks,
            steps_per_round,
            blocks_per_round,
        }
    }

    /// Slots per connector buffer.
    pub fn slots(&self) -> usize {
        self.substeps * self.subchunks
    }

    /// Payload bytes one step can carry with a `buff_size` buffer.
    pub fn step_bytes(&self, buff_size: usize) -> usize {
        (buff_size / self.slots()) & !(PACK_BYTES - 1)
    }

    /// Steps each proxy runs to move `nbytes` over `nrings` rings.
    pub fn nsteps(&self, nbytes: usize, nrings: usize, buff_size: usize) -> u64 {
        let chunk = self.step_bytes(buff_size) * self.substeps;
        let per_round = nrings * self.blocks_per_round * chunk;
        if per_round == 0 {
            return 0;
        }
        let nrounds = nbytes.div_ceil(per_round);
        (self.steps_per_round * nrounds * self.substeps) as u64
    }
}

impl Default for StepPlan {
    fn default() -> Self {
        StepPlan::new(2, 4, 1, 1)
    }
}

struct Link {
    transport: String,
    comm: Arc<dyn TransportComm>,
    connector: Arc<Connector>,
    proxy: Option<Proxy>,
}

impl Link {
    fn new(
        direction: Direction,
        transport: &dyn Transport,
        ring: &RingInfo,
        plan: &StepPlan,
    ) -> Result<Self> {
        let comm = match direction {
            Direction::Send => transport.send_comm(),
            Direction::Recv => transport.recv_comm(),
        };
        let mem = ConnectorMem::new(ring.buff_size(), plan.slots())?;
        Ok(Link {
            transport: transport.name().to_string(),
            comm,
            connector: Arc::new(Connector::new(direction, ring.clone(), mem)),
            proxy: None,
        })
    }
}

/// Both links of one rank in one ring.
pub struct RingConnections {
    ring: RingInfo,
    plan: StepPlan,
    config: Config,
    send: Link,
    recv: Link,
}

impl RingConnections {
    /// Links using `send_transport` towards the next rank and
    /// `recv_transport` from the previous one.
    pub fn new(
        ring: RingInfo,
        send_transport: &dyn Transport,
        recv_transport: &dyn Transport,
        plan: StepPlan,
        config: &Config,
    ) -> Result<Self> {
        let send = Link::new(Direction::Send, send_transport, &ring, &plan)?;
        let recv = Link::new(Direction::Recv, recv_transport, &ring, &plan)?;
        Ok(RingConnections {
            ring,
            plan,
            config: config.clone(),
            send,
            recv,
        })
    }

    fn link(&self, direction: Direction) -> &Link {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    /// The ring.
    pub fn ring(&self) -> &RingInfo {
        &self.ring
    }

    /// The step plan.
    pub fn plan(&self) -> &StepPlan {
        &self.plan
    }

    /// Connector for `direction`.
    pub fn connector(&self, direction: Direction) -> &Arc<Connector> {
        &self.link(direction).connector
    }

    /// Proxy for `direction`, once started.
    pub fn proxy(&self, direction: Direction) -> Option<&Proxy> {
        self.link(direction).proxy.as_ref()
    }

    /// Run the transport's setup for `direction`, returning the blob for the peer.
    pub fn setup(
        &self,
        direction: Direction,
        local: &TransportInfo,
        remote: &TransportInfo,
    ) -> Result<ConnectBlob> {
        let link = self.link(direction);
        link.comm.setup(local, remote, &link.connector)
    }

    /// Finish `direction` with the peer's blob.
    pub fn connect(&self, direction: Direction, blob: &ConnectBlob) -> Result<()> {
        let link = self.link(direction);
        link.comm.connect(blob, &link.connector)?;
        debug!(
            ring = self.ring.id(),
            rank = self.ring.rank(),
            peer = link.connector.peer(),
            ?direction,
            transport = %link.transport,
            "connected"
        );
        Ok(())
    }

    /// Spawn the proxy threads for both links. Idempotent.
    pub fn start_proxies(&mut self) -> Result<()> {
        let (ring, rank) = (self.ring.id(), self.ring.rank());
        for (direction, link) in [(Direction::Send, &mut self.send), (Direction::Recv, &mut self.recv)]
        {
            if link.proxy.is_some() {
                continue;
            }
            let side = match direction {
                Direction::Send => "send",
                Direction::Recv => "recv",
            };
            link.proxy = Some(Proxy::create(
                format!("ferroring-r{ring}-{side}-{rank}"),
                Arc::clone(&link.comm),
                Arc::clone(&link.connector),
                &self.config,
            )?);
        }
        Ok(())
    }

    /// Queue one operation on this ring alone. See [`save_proxies`].
    pub fn save_proxies(&self, pattern: RingPattern, nbytes: usize, op_count: u64) -> Result<u64> {
        let nsteps = save_proxies(std::slice::from_ref(self), pattern, nbytes, op_count)?;
        Ok(nsteps.first().copied().unwrap_or(0))
    }

    /// Stop both proxies and release transport resources.
    ///
    /// Every link is torn down even if an earlier one reports an error; the
    /// first error is returned.
    pub fn destroy_proxies(&mut self) -> Result<()> {
        let mut first_err = None;
        for link in [&mut self.send, &mut self.recv] {
            if let Some(proxy) = link.proxy.take() {
                if let Err(e) = proxy.destroy() {
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = link.comm.free(&link.connector) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for RingConnections {
    fn drop(&mut self) {
        let _ = self.destroy_proxies();
    }
}

impl std::fmt::Debug for RingConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingConnections")
            .field("ring", &self.ring)
            .field("plan", &self.plan)
            .field("send", &self.send.proxy)
            .field("recv", &self.recv.proxy)
            .finish()
    }
}

/// Queue one collective operation on every proxy it needs across `rings`.
///
/// Returns the step count queued on each ring. Nothing is queued if any
/// proxy the operation needs has failed or was never started. If one fails
/// while the operation is being queued, the operation is withdrawn from the
/// proxies that already accepted it; a proxy that has already started its
/// share runs that share to completion.
pub fn save_proxies(
    rings: &[RingConnections],
    pattern: RingPattern,
    nbytes: usize,
    op_count: u64,
) -> Result<Vec<u64>> {
    let mut queue = Vec::new();
    let mut steps = Vec::with_capacity(rings.len());
    for conns in rings {
        let nsteps = conns.plan.nsteps(nbytes, rings.len(), conns.ring.buff_size());
        steps.push(nsteps);
        for direction in [Direction::Recv, Direction::Send] {
            if !pattern.needs_proxy(direction, &conns.ring) {
                trace!(ring = conns.ring.id(), ?direction, ?pattern, "proxy not needed");
                continue;
            }
            let proxy = conns.proxy(direction).ok_or(Error::NotConnected)?;
            proxy.check()?;
            queue.push((proxy, conns.plan.slots(), nsteps));
        }
    }

    if steps.iter().all(|&n| n == 0) {
        return Ok(steps);
    }
    let mut accepted: Vec<&Proxy> = Vec::with_capacity(queue.len());
    for (proxy, substeps, nsteps) in queue {
        if nsteps == 0 {
            continue;
        }
        let args = ProxyArgs::new(Arc::clone(proxy.connector()), substeps, nsteps, op_count);
        if let Err(err) = proxy.enqueue(args) {
            for earlier in accepted {
                if earlier.withdraw(op_count) == 0 {
                    warn!(proxy = earlier.name(), op = op_count, "operation already started");
                }
            }
            return Err(err);
        }
        accepted.push(proxy);
    }
    Ok(steps)
}
