//! Transport over a [`NetPlugin`].
//!
//! The receiver's `setup` allocates a network endpoint and ships its
//! [`ConnectionHandle`] in the connect blob; the sender's `connect` turns that
//! handle into a send context. Both sides' `proxy` loops keep up to
//! `substeps` network operations in flight, complete them in step order, and
//! move the connector's step counters as they go.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{ConnectBlob, Connector, Transport, TransportComm, TransportInfo, TransportResources};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{ConnectionHandle, NetPlugin, NetRequest, NET_HANDLE_MAXSIZE};
use crate::proxy::ProxyArgs;
use crate::spin::{Backoff, IdleBackoff};

/// The network transport. Any rank can reach any other through it.
pub struct NetTransport {
    net: Arc<dyn NetPlugin>,
    idle_spins: u32,
}

impl NetTransport {
    /// Transport over `net` with default tunables.
    pub fn new(net: Arc<dyn NetPlugin>) -> Self {
        NetTransport::with_config(net, &Config::default())
    }

    /// Transport over `net`.
    pub fn with_config(net: Arc<dyn NetPlugin>, config: &Config) -> Self {
        NetTransport {
            net,
            idle_spins: config.proxy_idle_spins,
        }
    }

    /// The underlying plugin.
    pub fn plugin(&self) -> &Arc<dyn NetPlugin> {
        &self.net
    }
}

impl Transport for NetTransport {
    fn name(&self) -> &str {
        "NET"
    }

    fn fill_info(&self, rank: i32) -> Result<TransportInfo> {
        Ok(TransportInfo::from_payload(&rank.to_le_bytes()))
    }

    fn can_connect(&self, _local: &TransportInfo, _remote: &TransportInfo) -> bool {
        true
    }

    fn send_comm(&self) -> Arc<dyn TransportComm> {
        Arc::new(NetSendComm {
            net: Arc::clone(&self.net),
            idle_spins: self.idle_spins,
        })
    }

    fn recv_comm(&self) -> Arc<dyn TransportComm> {
        Arc::new(NetRecvComm {
            net: Arc::clone(&self.net),
            idle_spins: self.idle_spins,
        })
    }
}

struct NetSendComm {
    net: Arc<dyn NetPlugin>,
    idle_spins: u32,
}

struct NetRecvComm {
    net: Arc<dyn NetPlugin>,
    idle_spins: u32,
}

/// Requests issued for an operation but not yet completed.
///
/// Whatever is still queued when it drops is cancelled, so an aborted or
/// failed operation hands every slot and buffer back to the plugin.
struct InFlight<'a> {
    net: &'a dyn NetPlugin,
    requests: VecDeque<(u64, NetRequest)>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for (step, mut request) in self.requests.drain(..) {
            if let Err(err) = self.net.cancel(&mut request) {
                warn!(step, net = self.net.name(), error = %err, "cancel failed");
            }
        }
    }
}

/// Run one operation's steps. `ready(step)` says whether `step` may be
/// issued, `issue` starts it and `complete` is told its transferred size.
fn drive(
    net: &dyn NetPlugin,
    args: &ProxyArgs,
    idle_spins: u32,
    mut ready: impl FnMut(u64) -> bool,
    mut issue: impl FnMut(u64) -> Result<NetRequest>,
    mut complete: impl FnMut(u64, usize),
) -> Result<()> {
    let connector = args.connector();
    let base = connector.proxy_step();
    let end = base + args.nsteps();
    let window = args.substeps().clamp(1, connector.mem().slots()) as u64;

    let mut inflight = InFlight {
        net,
        requests: VecDeque::with_capacity(window as usize),
    };
    let mut next = base;
    let mut done = base;
    let mut backoff = IdleBackoff::new(idle_spins);

    while done < end {
        if connector.is_aborted() {
            debug!(step = done, in_flight = inflight.requests.len(), "proxy aborted");
            return Err(Error::Aborted);
        }
        let mut progress = false;

        if next < end && next - done < window && ready(next) {
            inflight.requests.push_back((next, issue(next)?));
            next += 1;
            progress = true;
        }

        if let Some((step, request)) = inflight.requests.front_mut() {
            if let Some(bytes) = net.test(request)? {
                complete(*step, bytes);
                inflight.requests.pop_front();
                done += 1;
                progress = true;
            }
        }

        if progress {
            backoff.reset();
        } else {
            backoff.snooze();
        }
    }

    connector.advance_proxy_step(args.nsteps());
    Ok(())
}

impl TransportComm for NetSendComm {
    fn setup(
        &self,
        _local: &TransportInfo,
        _remote: &TransportInfo,
        _connector: &Connector,
    ) -> Result<ConnectBlob> {
        Ok(ConnectBlob::zeroed())
    }

    fn connect(&self, blob: &ConnectBlob, connector: &Connector) -> Result<()> {
        let handle = ConnectionHandle::from_bytes(&blob.as_bytes()[..NET_HANDLE_MAXSIZE])?;
        let comm = self.net.connect_handle(handle)?;
        debug!(peer = comm.peer(), tag = comm.tag(), net = self.net.name(), "send connected");
        connector.set_resources(TransportResources::NetSend(comm));
        Ok(())
    }

    fn free(&self, connector: &Connector) -> Result<()> {
        connector.take_resources();
        Ok(())
    }

    fn proxy(&self, args: &ProxyArgs) -> Result<()> {
        let connector = args.connector();
        let TransportResources::NetSend(comm) = connector.resources()? else {
            return Err(Error::NotConnected);
        };
        let mem = connector.mem();
        trace!(
            peer = comm.peer(),
            first = connector.proxy_step(),
            nsteps = args.nsteps(),
            "send proxy"
        );
        drive(
            self.net.as_ref(),
            args,
            self.idle_spins,
            |step| mem.is_posted(step),
            |step| {
                let region = mem.slot_region(step)?.prefix(mem.size_of(step))?;
                self.net.isend(&comm, region)
            },
            |step, _| mem.consume(step),
        )
    }
}

impl TransportComm for NetRecvComm {
    fn setup(
        &self,
        _local: &TransportInfo,
        _remote: &TransportInfo,
        connector: &Connector,
    ) -> Result<ConnectBlob> {
        let (handle, comm) = self.net.get_handle()?;
        debug!(rank = comm.rank(), tag = comm.tag(), net = self.net.name(), "recv endpoint");
        connector.set_resources(TransportResources::NetRecv(comm));
        Ok(ConnectBlob::from_payload(handle.as_bytes()))
    }

    fn connect(&self, _blob: &ConnectBlob, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    fn free(&self, connector: &Connector) -> Result<()> {
        connector.take_resources();
        Ok(())
    }

    fn proxy(&self, args: &ProxyArgs) -> Result<()> {
        let connector = args.connector();
        let TransportResources::NetRecv(comm) = connector.resources()? else {
            return Err(Error::NotConnected);
        };
        let mem = connector.mem();
        trace!(
            tag = comm.tag(),
            first = connector.proxy_step(),
            nsteps = args.nsteps(),
            "recv proxy"
        );
        drive(
            self.net.as_ref(),
            args,
            self.idle_spins,
            |step| mem.is_free(step),
            |step| self.net.irecv(&comm, mem.slot_region(step)?),
            |step, bytes| mem.post(step, bytes),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Region, SharedBuffer};
    use crate::net::loopback::LoopbackFabric;
    use crate::ring::RingInfo;
    use crate::transport::{ConnectorMem, Direction, StepConsumer, StepProducer};

    fn pair() -> (NetTransport, NetTransport) {
        let fabric = LoopbackFabric::new(2);
        (
            NetTransport::new(Arc::new(fabric.endpoint(0).unwrap())),
            NetTransport::new(Arc::new(fabric.endpoint(1).unwrap())),
        )
    }

    fn connectors() -> (Arc<Connector>, Arc<Connector>) {
        let send = Connector::new(
            Direction::Send,
            RingInfo::new(0, &[0, 1], 0, 256).unwrap(),
            ConnectorMem::new(256, 4).unwrap(),
        );
        let recv = Connector::new(
            Direction::Recv,
            RingInfo::new(0, &[0, 1], 1, 256).unwrap(),
            ConnectorMem::new(256, 4).unwrap(),
        );
        (Arc::new(send), Arc::new(recv))
    }

    #[test]
    fn recv_setup_ships_the_handle() {
        let (t0, t1) = pair();
        let (send, recv) = connectors();
        let info0 = t0.fill_info(0).unwrap();
        let info1 = t1.fill_info(1).unwrap();
        assert_eq!(info1.read_i32(0), 1);

        let blob = t1.recv_comm().setup(&info1, &info0, &recv).unwrap();
        assert_eq!(blob.read_i32(0), 1);
        assert_eq!(blob.read_i32(4), crate::net::FIRST_TAG);

        assert!(matches!(send.resources(), Err(Error::NotConnected)));
        t0.send_comm().connect(&blob, &send).unwrap();
        match send.resources().unwrap() {
            TransportResources::NetSend(comm) => assert_eq!(comm.peer(), 1),
            other => panic!("unexpected resources {other:?}"),
        }
        t0.send_comm().free(&send).unwrap();
        assert!(send.take_resources().is_none());
    }

    #[test]
    fn proxies_move_steps_between_connectors() {
        let (t0, t1) = pair();
        let (send, recv) = connectors();
        let info = t0.fill_info(0).unwrap();
        let blob = t1.recv_comm().setup(&info, &info, &recv).unwrap();
        t0.send_comm().connect(&blob, &send).unwrap();

        let nsteps = 10;
        let sender = {
            let comm = t0.send_comm();
            let args = ProxyArgs::new(Arc::clone(&send), 4, nsteps, 0);
            std::thread::spawn(move || comm.proxy(&args))
        };
        let receiver = {
            let comm = t1.recv_comm();
            let args = ProxyArgs::new(Arc::clone(&recv), 4, nsteps, 0);
            std::thread::spawn(move || comm.proxy(&args))
        };

        let device_out = {
            let mem = Arc::clone(send.mem());
            std::thread::spawn(move || {
                let mut producer = StepProducer::new(mem);
                for step in 0..nsteps {
                    producer.send(&vec![step as u8; step as usize * 4]).unwrap();
                }
            })
        };
        let mut consumer = StepConsumer::new(Arc::clone(recv.mem()));
        let mut out = vec![0u8; recv.mem().slot_size()];
        for step in 0..nsteps {
            let n = consumer.recv(&mut out).unwrap();
            assert_eq!(n, step as usize * 4);
            assert!(out[..n].iter().all(|&b| b == step as u8));
        }

        device_out.join().unwrap();
        sender.join().unwrap().unwrap();
        receiver.join().unwrap().unwrap();
        assert_eq!(send.proxy_step(), nsteps);
        assert_eq!(recv.proxy_step(), nsteps);
        assert_eq!(t0.plugin().live_requests(), 0);
        assert_eq!(t1.plugin().live_requests(), 0);
    }

    #[test]
    fn proxy_requires_connection() {
        let (t0, _) = pair();
        let (send, _) = connectors();
        let args = ProxyArgs::new(send, 1, 1, 0);
        assert!(matches!(t0.send_comm().proxy(&args), Err(Error::NotConnected)));
    }

    #[test]
    fn aborted_connector_stops_the_loop() {
        let (_, t1) = pair();
        let (_, recv) = connectors();
        let info = t1.fill_info(1).unwrap();
        t1.recv_comm().setup(&info, &info, &recv).unwrap();
        recv.abort();
        let args = ProxyArgs::new(Arc::clone(&recv), 2, 4, 0);
        assert!(matches!(t1.recv_comm().proxy(&args), Err(Error::Aborted)));
        assert_eq!(recv.proxy_step(), 0);
    }

    #[test]
    fn abort_cancels_posted_receives() {
        let (_, t1) = pair();
        let (_, recv) = connectors();
        let info = t1.fill_info(1).unwrap();
        t1.recv_comm().setup(&info, &info, &recv).unwrap();

        let receiver = {
            let comm = t1.recv_comm();
            let args = ProxyArgs::new(Arc::clone(&recv), 4, 8, 0);
            std::thread::spawn(move || comm.proxy(&args))
        };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while t1.plugin().live_requests() < 4 {
            assert!(std::time::Instant::now() < deadline, "receives never posted");
            std::thread::yield_now();
        }

        recv.abort();
        assert!(matches!(receiver.join().unwrap(), Err(Error::Aborted)));
        assert_eq!(t1.plugin().live_requests(), 0);
        assert_eq!(recv.proxy_step(), 0);
    }

    #[test]
    fn truncated_step_fails_without_leaking() {
        let (t0, t1) = pair();
        let (send, recv) = connectors();
        let info = t0.fill_info(0).unwrap();
        let blob = t1.recv_comm().setup(&info, &info, &recv).unwrap();
        t0.send_comm().connect(&blob, &send).unwrap();
        let TransportResources::NetSend(comm) = send.resources().unwrap() else {
            panic!("sender not connected");
        };

        // Twice the receiver's 64-byte slot.
        let big = Region::whole(Arc::new(SharedBuffer::new(128)));
        let mut request = t0.plugin().isend(&comm, big).unwrap();
        assert_eq!(t0.plugin().test(&mut request).unwrap(), Some(128));

        let args = ProxyArgs::new(Arc::clone(&recv), 4, 4, 0);
        assert!(matches!(
            t1.recv_comm().proxy(&args),
            Err(Error::Truncated {
                capacity: 64,
                received: 128
            })
        ));
        assert_eq!(t1.plugin().live_requests(), 0);
    }
}
