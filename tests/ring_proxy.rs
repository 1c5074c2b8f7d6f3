//! Three ranks on one ring, with proxies moving staged steps between
//! neighbours over the loopback network.

mod common;

use std::sync::Arc;
use std::thread;

use common::{consume, init_tracing, produce, wait_until, Job};
use ferroring::net::NetPlugin;
use ferroring::transport::{StepConsumer, StepProducer};
use ferroring::{
    reduce_slices, save_proxies, Config, Direction, ProxyState, ReduceOp, RingConnections,
    RingPattern, StepPlan,
};

const NRANKS: usize = 3;
const NELEMS: usize = 3000;

fn config() -> Config {
    Config {
        buff_size: 4096,
        proxy_fifo_capacity: 4,
        proxy_idle_spins: 16,
        ..Config::default()
    }
}

fn rank_data(rank: usize) -> Vec<f32> {
    (0..NELEMS).map(|i| (rank * 10_000 + i) as f32).collect()
}

#[test]
fn ring_exchange_then_feed_from_root() {
    init_tracing();
    let job = Job::new(NRANKS, config());
    let plan = StepPlan::new(2, 2, 1, 1);
    let mut conns = job.connect_ring(0, &[0, 1, 2], plan);
    let nbytes = NELEMS * 4;

    for c in &conns {
        for direction in [Direction::Send, Direction::Recv] {
            assert_eq!(c.proxy(direction).unwrap().state(), ProxyState::Ready);
        }
    }

    // Op 0: every rank sends its data to the next and sums what it receives.
    let nsteps: Vec<u64> = conns
        .iter()
        .map(|c| c.save_proxies(RingPattern::Ring, nbytes, 0).unwrap())
        .collect();
    // Four 1024-byte slots: 2048 bytes per round, six rounds of two steps.
    assert_eq!(nsteps, vec![12; NRANKS]);

    let workers: Vec<_> = conns
        .iter()
        .enumerate()
        .map(|(rank, c)| {
            let send = Arc::clone(c.connector(Direction::Send).mem());
            let recv = Arc::clone(c.connector(Direction::Recv).mem());
            let n = nsteps[rank];
            let producer = thread::spawn(move || produce(send, &rank_data(rank), n));
            let consumer = thread::spawn(move || {
                let received = consume(recv, n);
                let own = rank_data(rank);
                let mut sum = vec![0f32; NELEMS];
                reduce_slices(ReduceOp::Sum, &mut sum, &own, &received).unwrap();
                sum
            });
            (producer, consumer)
        })
        .collect();

    for (rank, (producer, consumer)) in workers.into_iter().enumerate() {
        producer.join().unwrap();
        let sum = consumer.join().unwrap();
        let prev = (rank + NRANKS - 1) % NRANKS;
        let expected: Vec<f32> = rank_data(rank)
            .iter()
            .zip(rank_data(prev))
            .map(|(a, b)| a + b)
            .collect();
        assert_eq!(sum, expected, "rank {rank}");
    }

    for c in &conns {
        for direction in [Direction::Send, Direction::Recv] {
            let proxy = c.proxy(direction).unwrap();
            wait_until("op 0", || proxy.completed_ops() == 1);
            assert_eq!(c.connector(direction).proxy_step(), 12);
        }
    }

    // Op 1: data flows 0 -> 1 -> 2 only. The root receives nothing and the
    // last rank sends nothing.
    let pattern = RingPattern::FeedFrom { root: 0 };
    for c in &conns {
        assert_eq!(c.save_proxies(pattern, nbytes, 1).unwrap(), 12);
    }

    let root_send = Arc::clone(conns[0].connector(Direction::Send).mem());
    let root = thread::spawn(move || produce(root_send, &rank_data(0), 12));

    let middle_recv = Arc::clone(conns[1].connector(Direction::Recv).mem());
    let middle_send = Arc::clone(conns[1].connector(Direction::Send).mem());
    let middle = thread::spawn(move || {
        let mut consumer = StepConsumer::new(middle_recv);
        let mut producer = StepProducer::new(middle_send);
        let mut chunk = vec![0f32; 256];
        for _ in 0..12 {
            let n = consumer.recv_elems(&mut chunk).unwrap();
            producer.send_elems(&chunk[..n]).unwrap();
        }
    });

    let last_recv = Arc::clone(conns[2].connector(Direction::Recv).mem());
    let last = thread::spawn(move || consume(last_recv, 12));

    root.join().unwrap();
    middle.join().unwrap();
    assert_eq!(last.join().unwrap(), rank_data(0));

    let expect_ops = [
        // (rank, send ops, recv ops)
        (0, 2, 1),
        (1, 2, 2),
        (2, 1, 2),
    ];
    for (rank, send_ops, recv_ops) in expect_ops {
        let send = conns[rank].proxy(Direction::Send).unwrap();
        let recv = conns[rank].proxy(Direction::Recv).unwrap();
        wait_until("op 1", || {
            send.completed_ops() == send_ops && recv.completed_ops() == recv_ops
        });
        assert_eq!(send.queued(), 0);
        assert_eq!(recv.queued(), 0);
    }
    // Skipped connectors keep their step counters where op 0 left them.
    assert_eq!(conns[0].connector(Direction::Recv).proxy_step(), 12);
    assert_eq!(conns[2].connector(Direction::Send).proxy_step(), 12);
    assert_eq!(conns[1].connector(Direction::Recv).proxy_step(), 24);

    for c in &mut conns {
        c.destroy_proxies().unwrap();
        assert!(c.proxy(Direction::Send).is_none());
    }
    for net in &job.nets {
        assert_eq!(net.live_requests(), 0);
    }
}

#[test]
fn zero_byte_operation_queues_nothing() {
    let job = Job::new(2, config());
    let conns = job.connect_ring(0, &[1, 0], StepPlan::default());
    for c in &conns {
        assert_eq!(c.save_proxies(RingPattern::Ring, 0, 0).unwrap(), 0);
        assert_eq!(c.proxy(Direction::Send).unwrap().queued(), 0);
        assert_eq!(c.proxy(Direction::Recv).unwrap().queued(), 0);
    }
}

#[test]
fn rings_share_each_operation() {
    init_tracing();
    let job = Job::new(2, config());
    let plan = StepPlan::new(1, 2, 1, 1);
    let per_rank: Vec<Vec<RingConnections>> = job
        .connect_ring(0, &[0, 1], plan)
        .into_iter()
        .zip(job.connect_ring(1, &[1, 0], plan))
        .map(|(first, second)| vec![first, second])
        .collect();
    // Two 2048-byte slots per connector; two rings carry 4096 bytes a round.
    let nbytes = 8192;
    for c in per_rank.iter().flatten() {
        assert_eq!(c.plan().nsteps(nbytes, 2, c.ring().buff_size()), 2);
    }
    for links in &per_rank {
        assert_eq!(
            save_proxies(links, RingPattern::Ring, nbytes, 0).unwrap(),
            vec![2, 2]
        );
    }

    let mut workers = Vec::new();
    for (rank, links) in per_rank.iter().enumerate() {
        for (id, c) in links.iter().enumerate() {
            let send = Arc::clone(c.connector(Direction::Send).mem());
            let recv = Arc::clone(c.connector(Direction::Recv).mem());
            let data: Vec<f32> = (0..1024).map(|i| (rank * 100 + id * 10 + i) as f32).collect();
            workers.push(thread::spawn(move || produce(send, &data, 2)));
            let expected: Vec<f32> = (0..1024)
                .map(|i| ((1 - rank) * 100 + id * 10 + i) as f32)
                .collect();
            workers.push(thread::spawn(move || {
                assert_eq!(consume(recv, 2), expected);
            }));
        }
    }
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn destroy_cancels_receives_still_posted() {
    init_tracing();
    let job = Job::new(2, config());
    let mut conns = job.connect_ring(0, &[0, 1], StepPlan::new(2, 2, 1, 1));

    // Rank 1 is the root: it only receives, and rank 0 never sends.
    let pattern = RingPattern::FeedTo { root: 1 };
    assert_eq!(conns[1].save_proxies(pattern, 4096, 0).unwrap(), 4);
    let net = &job.nets[1];
    wait_until("receives posted", || net.live_requests() == 4);

    conns[1].destroy_proxies().unwrap();
    assert_eq!(net.live_requests(), 0);
    assert_eq!(conns[1].connector(Direction::Recv).proxy_step(), 0);

    conns[0].destroy_proxies().unwrap();
    assert_eq!(job.nets[0].live_requests(), 0);
}
