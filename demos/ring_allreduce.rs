//! Ring allreduce example - proxies moving chunks around a ring.
//!
//! Four ranks run as threads in one process over the loopback network. Each
//! rank's data is cut into one chunk per rank; a reduce-scatter pass followed
//! by an allgather pass leaves every rank with the element-wise sum.
//!
//! Run with: cargo run --example ring_allreduce

use std::sync::Arc;
use std::thread;

use ferroring::net::loopback::LoopbackFabric;
use ferroring::net::NetPlugin;
use ferroring::transport::net::NetTransport;
use ferroring::transport::{StepConsumer, StepProducer};
use ferroring::{
    reduce_slices, Config, Direction, ReduceOp, Result, RingConnections, RingInfo, RingPattern,
    StepPlan, Transport,
};

const NRANKS: usize = 4;
const CHUNK: usize = 256;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let config = Config {
        buff_size: 4096,
        ..Config::default()
    };
    // Each of the 2 * (N - 1) algorithm steps moves one chunk in one slot.
    let plan = StepPlan::new(1, 4, 2 * (NRANKS - 1), NRANKS);
    let order: Vec<i32> = (0..NRANKS as i32).collect();

    let fabric = LoopbackFabric::new(NRANKS);
    let mut transports = Vec::with_capacity(NRANKS);
    let mut infos = Vec::with_capacity(NRANKS);
    for rank in 0..NRANKS {
        let net: Arc<dyn NetPlugin> = Arc::new(fabric.endpoint_with_config(rank, &config)?);
        let transport = NetTransport::with_config(net, &config);
        infos.push(transport.fill_info(rank as i32)?);
        transports.push(transport);
    }

    let mut conns = Vec::with_capacity(NRANKS);
    for (rank, transport) in transports.iter().enumerate() {
        let ring = RingInfo::new(0, &order, rank as i32, config.buff_size)?;
        conns.push(RingConnections::new(ring, transport, transport, plan, &config)?);
    }

    // Handshake: receivers publish handles, senders connect to their successor.
    let mut recv_blobs = Vec::with_capacity(NRANKS);
    let mut send_blobs = Vec::with_capacity(NRANKS);
    for (rank, c) in conns.iter().enumerate() {
        let (next, prev) = (c.ring().next() as usize, c.ring().prev() as usize);
        recv_blobs.push(c.setup(Direction::Recv, &infos[rank], &infos[prev])?);
        send_blobs.push(c.setup(Direction::Send, &infos[rank], &infos[next])?);
    }
    for c in &mut conns {
        let (next, prev) = (c.ring().next() as usize, c.ring().prev() as usize);
        c.connect(Direction::Send, &recv_blobs[next])?;
        c.connect(Direction::Recv, &send_blobs[prev])?;
        c.start_proxies()?;
    }

    let nbytes = NRANKS * CHUNK * std::mem::size_of::<f32>();
    let mut devices = Vec::with_capacity(NRANKS);
    for (rank, c) in conns.iter().enumerate() {
        let nsteps = c.save_proxies(RingPattern::Ring, nbytes, 0)?;
        println!("Rank {rank}: queued {nsteps} steps on each proxy");
        let send = Arc::clone(c.connector(Direction::Send).mem());
        let recv = Arc::clone(c.connector(Direction::Recv).mem());
        devices.push(thread::spawn(move || allreduce(rank, send, recv)));
    }

    let expected: Vec<f32> = (0..NRANKS * CHUNK)
        .map(|i| (0..NRANKS).map(|r| input(r, i)).sum())
        .collect();
    for (rank, device) in devices.into_iter().enumerate() {
        let result = device
            .join()
            .map_err(|_| ferroring::Error::Internal(format!("rank {rank} panicked")))??;
        assert_eq!(result, expected, "Data mismatch on rank {rank}!");
    }

    for c in &mut conns {
        c.destroy_proxies()?;
    }
    println!("\nRing allreduce over {NRANKS} ranks passed!");
    Ok(())
}

fn input(rank: usize, i: usize) -> f32 {
    (rank * 1000 + i % 1000) as f32
}

fn allreduce(
    rank: usize,
    send: Arc<ferroring::transport::ConnectorMem>,
    recv: Arc<ferroring::transport::ConnectorMem>,
) -> Result<Vec<f32>> {
    let mut data: Vec<f32> = (0..NRANKS * CHUNK).map(|i| input(rank, i)).collect();
    let mut producer = StepProducer::new(send);
    let mut consumer = StepConsumer::new(recv);
    let mut incoming = vec![0f32; CHUNK];
    let chunk = |c: usize| (c % NRANKS) * CHUNK..(c % NRANKS + 1) * CHUNK;

    // Reduce-scatter: afterwards chunk rank + 1 holds the full sum.
    for s in 0..NRANKS - 1 {
        producer.send_elems(&data[chunk(rank + NRANKS - s)])?;
        consumer.recv_elems(&mut incoming)?;
        let target = chunk(rank + 2 * NRANKS - s - 1);
        let partial = data[target.clone()].to_vec();
        reduce_slices(ReduceOp::Sum, &mut data[target], &partial, &incoming)?;
    }

    // Allgather: pass the finished chunks along.
    for s in 0..NRANKS - 1 {
        producer.send_elems(&data[chunk(rank + 1 + NRANKS - s)])?;
        consumer.recv_elems(&mut incoming)?;
        data[chunk(rank + NRANKS - s)].copy_from_slice(&incoming);
    }
    Ok(data)
}
