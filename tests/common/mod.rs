//! Helpers shared by the integration tests: ring bring-up over the loopback
//! fabric and threads standing in for device-side kernels.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferroring::net::loopback::{LoopbackFabric, LoopbackNet};
use ferroring::transport::net::NetTransport;
use ferroring::transport::{ConnectorMem, StepConsumer, StepProducer, TransportInfo};
use ferroring::{select_transport, Config, Direction, RingConnections, RingInfo, StepPlan, Transport};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `done` for up to ten seconds.
pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// One simulated job: a network endpoint and transport list per rank.
pub struct Job {
    pub nets: Vec<Arc<LoopbackNet>>,
    pub transports: Vec<Vec<Arc<dyn Transport>>>,
    pub infos: Vec<Vec<TransportInfo>>,
    pub config: Config,
}

impl Job {
    pub fn new(nranks: usize, config: Config) -> Self {
        let fabric = LoopbackFabric::new(nranks);
        let nets: Vec<Arc<LoopbackNet>> = (0..nranks)
            .map(|r| Arc::new(fabric.endpoint_with_config(r, &config).unwrap()))
            .collect();
        let transports: Vec<Vec<Arc<dyn Transport>>> = nets
            .iter()
            .map(|net| {
                let net: Arc<dyn ferroring::net::NetPlugin> = Arc::clone(net) as _;
                vec![Arc::new(NetTransport::with_config(net, &config)) as Arc<dyn Transport>]
            })
            .collect();
        let infos = transports
            .iter()
            .enumerate()
            .map(|(r, ts)| ts.iter().map(|t| t.fill_info(r as i32).unwrap()).collect())
            .collect();
        Job {
            nets,
            transports,
            infos,
            config,
        }
    }

    pub fn nranks(&self) -> usize {
        self.nets.len()
    }

    /// Connect ring `id` visiting `order` on every rank and start its proxies.
    pub fn connect_ring(&self, id: usize, order: &[i32], plan: StepPlan) -> Vec<RingConnections> {
        let mut conns: Vec<RingConnections> = (0..self.nranks())
            .map(|r| {
                let ring = RingInfo::new(id, order, r as i32, self.config.buff_size).unwrap();
                let (next, prev) = (ring.next() as usize, ring.prev() as usize);
                let send = select_transport(
                    &self.transports[r],
                    &self.infos[r],
                    &self.infos[next],
                    next as i32,
                )
                .unwrap();
                let recv = select_transport(
                    &self.transports[r],
                    &self.infos[r],
                    &self.infos[prev],
                    prev as i32,
                )
                .unwrap();
                RingConnections::new(ring, send.as_ref(), recv.as_ref(), plan, &self.config)
                    .unwrap()
            })
            .collect();
        connect_all(&mut conns, &self.infos);
        conns
    }
}

/// Exchange setup blobs along the ring, connect both directions and start
/// every proxy. `conns[r]` belongs to rank `r`.
pub fn connect_all(conns: &mut [RingConnections], infos: &[Vec<TransportInfo>]) {
    let blobs: Vec<_> = conns
        .iter()
        .enumerate()
        .map(|(r, c)| {
            let ring = c.ring();
            let (next, prev) = (ring.next() as usize, ring.prev() as usize);
            (
                c.setup(Direction::Send, &infos[r][0], &infos[next][0]).unwrap(),
                c.setup(Direction::Recv, &infos[r][0], &infos[prev][0]).unwrap(),
            )
        })
        .collect();
    for c in conns.iter_mut() {
        let (next, prev) = (c.ring().next() as usize, c.ring().prev() as usize);
        c.connect(Direction::Send, &blobs[next].1).unwrap();
        c.connect(Direction::Recv, &blobs[prev].0).unwrap();
        c.start_proxies().unwrap();
    }
}

/// Feed `data` into a send connector, `per_step` elements at a time.
pub fn produce(mem: Arc<ConnectorMem>, data: &[f32], nsteps: u64) {
    let per_step = mem.slot_size() / 4;
    let mut producer = StepProducer::new(mem);
    for step in 0..nsteps as usize {
        let lo = (step * per_step).min(data.len());
        let hi = ((step + 1) * per_step).min(data.len());
        producer.send_elems(&data[lo..hi]).unwrap();
    }
}

/// Drain `nsteps` steps from a receive connector.
pub fn consume(mem: Arc<ConnectorMem>, nsteps: u64) -> Vec<f32> {
    let mut chunk = vec![0f32; mem.slot_size() / 4];
    let mut consumer = StepConsumer::new(mem);
    let mut all = Vec::new();
    for _ in 0..nsteps {
        let n = consumer.recv_elems(&mut chunk).unwrap();
        all.extend_from_slice(&chunk[..n]);
    }
    all
}
