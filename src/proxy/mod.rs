//! Proxy threads.
//!
//! Every connector that needs host-side progress gets one [`Proxy`]: an OS
//! thread that pops [`ProxyArgs`] from its [`ProxyFifo`] and runs the
//! transport's `proxy` operation on each, in order, to completion.
//!
//! ```text
//! Created --spawn--> Ready --pop--> Running --ok--> Ready
//!                                     |
//!                                     +--err--> Failed
//! (any) --destroy--> Destroyed
//! ```
//!
//! A failure is scoped to its connection: the failing proxy closes its FIFO
//! and stops, while other proxies keep running. Producers learn about it from
//! [`Proxy::enqueue`] and [`Proxy::destroy`].

mod fifo;

pub use fifo::ProxyFifo;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{Connector, TransportComm};

/// One multi-step transfer queued for a proxy.
#[derive(Debug, Clone)]
pub struct ProxyArgs {
    connector: Arc<Connector>,
    substeps: usize,
    nsteps: u64,
    op_count: u64,
}

impl ProxyArgs {
    /// Transfer of `nsteps` steps on `connector`, keeping at most `substeps`
    /// in flight, for collective operation number `op_count`.
    pub fn new(connector: Arc<Connector>, substeps: usize, nsteps: u64, op_count: u64) -> Self {
        ProxyArgs {
            connector,
            substeps,
            nsteps,
            op_count,
        }
    }

    /// Connector the transfer runs on.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Steps the transport may keep in flight.
    pub fn substeps(&self) -> usize {
        self.substeps
    }

    /// Total steps.
    pub fn nsteps(&self) -> u64 {
        self.nsteps
    }

    /// Sequence number of the owning collective operation.
    pub fn op_count(&self) -> u64 {
        self.op_count
    }
}

/// Lifecycle of a proxy thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Thread spawned but not yet waiting for work.
    Created,
    /// Waiting on the FIFO.
    Ready,
    /// Executing one transfer.
    Running,
    /// A transfer failed; the thread has exited.
    Failed,
    /// Thread joined.
    Destroyed,
}

struct Shared {
    name: String,
    fifo: ProxyFifo<ProxyArgs>,
    state: Mutex<ProxyState>,
    state_changed: Condvar,
    failure: Mutex<Option<String>>,
    discard_before: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ProxyState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    fn run(&self, comm: &dyn TransportComm) {
        self.set_state(ProxyState::Ready);
        while let Some(args) = self.fifo.pop() {
            if args.op_count() < self.discard_before.load(Ordering::Acquire) {
                trace!(proxy = %self.name, op = args.op_count(), "stale operation skipped");
                continue;
            }
            self.set_state(ProxyState::Running);
            match comm.proxy(&args) {
                Ok(()) => {
                    self.completed.fetch_add(1, Ordering::AcqRel);
                    self.set_state(ProxyState::Ready);
                }
                Err(Error::Aborted) if args.connector().is_aborted() => {
                    debug!(proxy = %self.name, op = args.op_count(), "operation aborted");
                    return;
                }
                Err(err) => {
                    *self.failure.lock() = Some(err.to_string());
                    let discarded = self.fifo.close();
                    warn!(
                        proxy = %self.name,
                        op = args.op_count(),
                        discarded,
                        error = %err,
                        "proxy failed"
                    );
                    self.set_state(ProxyState::Failed);
                    return;
                }
            }
        }
    }
}

/// Handle to a running proxy thread.
pub struct Proxy {
    shared: Arc<Shared>,
    connector: Arc<Connector>,
    thread: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Spawn a proxy driving `connector` through `comm`.
    ///
    /// Returns once the thread is waiting on its FIFO.
    pub fn create(
        name: impl Into<String>,
        comm: Arc<dyn TransportComm>,
        connector: Arc<Connector>,
        config: &Config,
    ) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            fifo: ProxyFifo::new(config.proxy_fifo_capacity),
            state: Mutex::new(ProxyState::Created),
            state_changed: Condvar::new(),
            failure: Mutex::new(None),
            discard_before: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || shared.run(comm.as_ref()))
                .map_err(|e| Error::Internal(format!("failed to spawn proxy {name}: {e}")))?
        };

        {
            let mut state = shared.state.lock();
            while *state == ProxyState::Created {
                shared.state_changed.wait(&mut state);
            }
        }
        debug!(proxy = %shared.name, capacity = shared.fifo.capacity(), "proxy ready");

        Ok(Proxy {
            shared,
            connector,
            thread: Some(thread),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Connector this proxy drives.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Current state.
    pub fn state(&self) -> ProxyState {
        *self.shared.state.lock()
    }

    /// Transfers completed so far.
    pub fn completed_ops(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Entries waiting in the FIFO.
    pub fn queued(&self) -> usize {
        self.shared.fifo.len()
    }

    /// Error that stopped the proxy, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    fn failed(&self, reason: String) -> Error {
        Error::ProxyFailed {
            proxy: self.shared.name.clone(),
            reason,
        }
    }

    /// Check that the proxy can still accept work.
    pub fn check(&self) -> Result<()> {
        match self.failure() {
            Some(reason) => Err(self.failed(reason)),
            None => Ok(()),
        }
    }

    /// Queue a transfer, blocking while the FIFO is full.
    pub fn enqueue(&self, args: ProxyArgs) -> Result<()> {
        debug_assert!(Arc::ptr_eq(args.connector(), &self.connector));
        self.check()?;
        let (op, nsteps) = (args.op_count(), args.nsteps());
        match self.shared.fifo.push(args) {
            Ok(()) => {
                trace!(proxy = %self.shared.name, op, nsteps, "enqueued");
                Ok(())
            }
            // The FIFO closes when the thread fails while we were blocked.
            Err(Error::ProxyStopped) => {
                self.check()?;
                Err(Error::ProxyStopped)
            }
            Err(e) => Err(e),
        }
    }

    /// Take back transfers for operation `op_count` that the thread has not
    /// started yet. Returns how many were removed.
    pub fn withdraw(&self, op_count: u64) -> usize {
        let removed = self.shared.fifo.withdraw(|args| args.op_count() == op_count);
        if removed > 0 {
            trace!(proxy = %self.shared.name, op = op_count, removed, "withdrawn");
        }
        removed
    }

    /// Skip queued transfers belonging to operations before `op_count`.
    pub fn discard_before(&self, op_count: u64) {
        self.shared.discard_before.fetch_max(op_count, Ordering::AcqRel);
    }

    fn shutdown(&mut self) -> Result<usize> {
        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };
        self.connector.abort();
        let discarded = self.shared.fifo.close();
        thread
            .join()
            .map_err(|_| Error::Internal(format!("proxy {} panicked", self.shared.name)))?;
        let failure = self.shared.failure.lock().clone();
        self.shared.set_state(ProxyState::Destroyed);
        debug!(proxy = %self.shared.name, discarded, "proxy destroyed");
        match failure {
            Some(reason) => Err(self.failed(reason)),
            None => Ok(discarded),
        }
    }

    /// Stop the thread, aborting in-flight work and discarding queued work.
    ///
    /// Returns the number of discarded entries, or the error that made the
    /// proxy fail.
    pub fn destroy(mut self) -> Result<usize> {
        self.shutdown()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("completed", &self.completed_ops())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingInfo;
    use crate::transport::{ConnectBlob, ConnectorMem, Direction, TransportInfo};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Transport whose proxy runs until the test releases it.
    struct Gated {
        release: Mutex<mpsc::Receiver<()>>,
    }

    /// Transport whose proxy fails for one operation number.
    struct FailsAt(u64);

    macro_rules! no_setup {
        () => {
            fn setup(&self, _: &TransportInfo, _: &TransportInfo, _: &Connector) -> Result<ConnectBlob> {
                Ok(ConnectBlob::zeroed())
            }
            fn connect(&self, _: &ConnectBlob, _: &Connector) -> Result<()> {
                Ok(())
            }
            fn free(&self, _: &Connector) -> Result<()> {
                Ok(())
            }
        };
    }

    impl TransportComm for Gated {
        no_setup!();
        fn proxy(&self, _: &ProxyArgs) -> Result<()> {
            self.release
                .lock()
                .recv()
                .map_err(|_| Error::Internal("gate dropped".into()))
        }
    }

    impl TransportComm for FailsAt {
        no_setup!();
        fn proxy(&self, args: &ProxyArgs) -> Result<()> {
            if args.op_count() == self.0 {
                Err(Error::Backend(13))
            } else {
                Ok(())
            }
        }
    }

    fn connector() -> Arc<Connector> {
        Arc::new(Connector::new(
            Direction::Send,
            RingInfo::new(0, &[0, 1], 0, 64).unwrap(),
            ConnectorMem::new(64, 1).unwrap(),
        ))
    }

    fn wait_for(proxy: &Proxy, what: impl Fn(&Proxy) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !what(proxy) {
            assert!(Instant::now() < deadline, "timed out, proxy is {proxy:?}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn idle_until_enqueued_then_back_to_ready() {
        let (tx, rx) = mpsc::channel();
        let comm = Arc::new(Gated {
            release: Mutex::new(rx),
        });
        let conn = connector();
        let proxy = Proxy::create("gated", comm, Arc::clone(&conn), &Config::default()).unwrap();
        assert_eq!(proxy.state(), ProxyState::Ready);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(proxy.state(), ProxyState::Ready);
        assert_eq!(proxy.completed_ops(), 0);

        proxy.enqueue(ProxyArgs::new(conn, 1, 1, 0)).unwrap();
        wait_for(&proxy, |p| p.state() == ProxyState::Running);

        tx.send(()).unwrap();
        wait_for(&proxy, |p| p.completed_ops() == 1);
        wait_for(&proxy, |p| p.state() == ProxyState::Ready);
        assert_eq!(proxy.destroy().unwrap(), 0);
    }

    #[test]
    fn steps_run_in_enqueue_order() {
        struct Record(Mutex<Vec<u64>>);
        impl TransportComm for Record {
            no_setup!();
            fn proxy(&self, args: &ProxyArgs) -> Result<()> {
                self.0.lock().push(args.op_count());
                Ok(())
            }
        }

        let comm = Arc::new(Record(Mutex::new(Vec::new())));
        let conn = connector();
        let config = Config {
            proxy_fifo_capacity: 2,
            ..Config::default()
        };
        let proxy = Proxy::create("record", comm.clone(), Arc::clone(&conn), &config).unwrap();
        for op in 0..20 {
            proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, op)).unwrap();
        }
        wait_for(&proxy, |p| p.completed_ops() == 20);
        proxy.destroy().unwrap();
        assert_eq!(*comm.0.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn stale_operations_are_skipped() {
        let (tx, rx) = mpsc::channel();
        let comm = Arc::new(Gated {
            release: Mutex::new(rx),
        });
        let conn = connector();
        let proxy = Proxy::create("stale", comm, Arc::clone(&conn), &Config::default()).unwrap();
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 0)).unwrap();
        wait_for(&proxy, |p| p.state() == ProxyState::Running);
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 1)).unwrap();
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 2)).unwrap();
        proxy.discard_before(2);
        tx.send(()).unwrap();
        tx.send(()).unwrap();
        wait_for(&proxy, |p| p.completed_ops() == 2);
        assert_eq!(proxy.queued(), 0);
        proxy.destroy().unwrap();
    }

    #[test]
    fn withdraw_takes_back_unstarted_transfers() {
        let (tx, rx) = mpsc::channel();
        let comm = Arc::new(Gated {
            release: Mutex::new(rx),
        });
        let conn = connector();
        let proxy = Proxy::create("withdraw", comm, Arc::clone(&conn), &Config::default()).unwrap();
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 0)).unwrap();
        wait_for(&proxy, |p| p.state() == ProxyState::Running);
        for op in [1, 2, 1] {
            proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, op)).unwrap();
        }

        assert_eq!(proxy.withdraw(0), 0);
        assert_eq!(proxy.withdraw(1), 2);
        assert_eq!(proxy.queued(), 1);
        tx.send(()).unwrap();
        tx.send(()).unwrap();
        wait_for(&proxy, |p| p.completed_ops() == 2);
        assert_eq!(proxy.queued(), 0);
        proxy.destroy().unwrap();
    }

    #[test]
    fn failure_is_scoped_to_its_connection() {
        let config = Config::default();
        let bad_conn = connector();
        let good_conn = connector();
        let bad = Proxy::create("bad", Arc::new(FailsAt(1)), Arc::clone(&bad_conn), &config).unwrap();
        let good =
            Proxy::create("good", Arc::new(FailsAt(u64::MAX)), Arc::clone(&good_conn), &config)
                .unwrap();

        for op in 0..3 {
            // Entries queued behind the failing one are discarded or refused.
            let _ = bad.enqueue(ProxyArgs::new(Arc::clone(&bad_conn), 1, 1, op));
            good.enqueue(ProxyArgs::new(Arc::clone(&good_conn), 1, 1, op)).unwrap();
        }
        wait_for(&bad, |p| p.state() == ProxyState::Failed);
        wait_for(&good, |p| p.completed_ops() == 3);

        assert_eq!(bad.completed_ops(), 1);
        assert!(bad.failure().unwrap().contains("code 13"));
        assert!(matches!(
            bad.enqueue(ProxyArgs::new(Arc::clone(&bad_conn), 1, 1, 3)),
            Err(Error::ProxyFailed { .. })
        ));

        good.enqueue(ProxyArgs::new(Arc::clone(&good_conn), 1, 1, 3)).unwrap();
        wait_for(&good, |p| p.completed_ops() == 4);
        assert_eq!(good.state(), ProxyState::Ready);

        assert!(matches!(bad.destroy(), Err(Error::ProxyFailed { proxy, .. }) if proxy == "bad"));
        assert_eq!(good.destroy().unwrap(), 0);
    }

    #[test]
    fn destroy_aborts_and_discards() {
        struct UntilAborted;
        impl TransportComm for UntilAborted {
            no_setup!();
            fn proxy(&self, args: &ProxyArgs) -> Result<()> {
                while !args.connector().is_aborted() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(Error::Aborted)
            }
        }

        let conn = connector();
        let proxy =
            Proxy::create("abort", Arc::new(UntilAborted), Arc::clone(&conn), &Config::default())
                .unwrap();
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 0)).unwrap();
        wait_for(&proxy, |p| p.state() == ProxyState::Running);
        proxy.enqueue(ProxyArgs::new(Arc::clone(&conn), 1, 1, 1)).unwrap();

        assert_eq!(proxy.destroy().unwrap(), 1);
        assert!(conn.is_aborted());
    }
}
