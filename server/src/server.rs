//! Accept connections into free slots and spawn a drain task for each.

use crate::{
    drain, metrics::Metrics, signal::Signal, Config, ConnectionBuffer, Error, Handler, Listener,
    Peer, SlotPool,
};
use prometheus_client::registry::Registry;
use std::{io::Error as IoError, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{select, sync::mpsc, task::JoinSet, time::sleep};
use tracing::{debug, error, warn};

/// Time to wait before retrying after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Accepts connections from a [Listener] into a bounded [SlotPool].
///
/// The server only calls [Listener::accept] once it holds a free slot, so connections beyond
/// the pool's size stay in the listener's backlog until a drain task releases a slot.
pub struct Server<L: Listener, H: Handler> {
    cfg: Config,
    listener: L,
    pool: SlotPool<L::Connection>,
    handler: H,
    metrics: Arc<Metrics>,
}

impl<L: Listener, H: Handler> Server<L, H> {
    /// Create a new [Server] that accepts from `listener` and hands drained connections to
    /// `handler`.
    pub fn new(
        cfg: Config,
        listener: L,
        handler: H,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let pool = SlotPool::new(cfg.max_concurrent_requests);
        let metrics = Arc::new(Metrics::init(registry));
        Ok(Self {
            cfg,
            listener,
            pool,
            handler,
            metrics,
        })
    }

    /// Returns the server's slots.
    ///
    /// The pool may be used to inspect live connections (see [crate::Slot::extract_range]).
    pub fn pool(&self) -> SlotPool<L::Connection> {
        self.pool.clone()
    }

    /// Returns the address the server accepts connections on.
    pub fn local_addr(&self) -> Result<SocketAddr, IoError> {
        self.listener.local_addr()
    }

    /// Accept and drain connections until `stop` resolves or a drain task hits a fatal error.
    ///
    /// Drain tasks still running when this returns are aborted and their slots vacated, closing
    /// the connections they held. The handler is not called for those connections.
    pub async fn run(mut self, stop: Signal) -> Result<(), Error> {
        let mut drains = JoinSet::new();
        let result = self.serve(stop, &mut drains).await;

        // Abort in-flight drains, then close whatever they left behind
        drains.shutdown().await;
        let vacated = self.pool.vacate_all().await;
        self.metrics.occupied_slots.set(self.pool.occupied() as i64);
        debug!(vacated, "closed remaining connections");
        result
    }

    async fn serve(&mut self, mut stop: Signal, drains: &mut JoinSet<()>) -> Result<(), Error> {
        let (fatal_sender, mut fatal_receiver) = mpsc::unbounded_channel();
        loop {
            // Reap finished drain tasks
            while let Some(result) = drains.try_join_next() {
                if let Err(err) = result {
                    error!(?err, "drain task failed");
                }
            }

            // Reserve a slot before accepting
            let reserved = select! {
                _ = &mut stop => None,
                Some(err) = fatal_receiver.recv() => return Err(err),
                handle = self.pool.acquire() => Some(handle),
            };
            let Some(mut handle) = reserved else {
                debug!("stopping acceptor");
                return Ok(());
            };
            debug!(slot = handle.index(), "reserved slot");

            // Accept a connection into the reserved slot
            let accepted = select! {
                _ = &mut stop => None,
                Some(err) = fatal_receiver.recv() => return Err(err),
                result = self.listener.accept() => Some(result),
            };
            let (address, connection) = match accepted {
                Some(Ok(accepted)) => accepted,
                Some(Err(err)) => {
                    warn!(?err, "failed to accept connection");
                    self.metrics.accept_failures.inc();
                    handle.release();
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                None => {
                    debug!("stopping acceptor");
                    return Ok(());
                }
            };

            // Populate the slot and hand it to a drain task
            handle.populate(ConnectionBuffer::new(
                Peer::new(address, connection),
                self.cfg.initial_buffer_size,
                self.cfg.max_buffer_size,
            ));
            let slot = handle.slot().clone();
            handle.release();
            self.metrics.connections_accepted.inc();
            self.metrics.occupied_slots.set(self.pool.occupied() as i64);
            debug!(slot = slot.index(), %address, "accepted connection");

            let pool = self.pool.clone();
            let handler = self.handler.clone();
            let metrics = self.metrics.clone();
            let fatal_sender = fatal_sender.clone();
            let idle_timeout = self.cfg.idle_timeout;
            drains.spawn(async move {
                let result = drain(&slot, &handler, idle_timeout).await;
                metrics.occupied_slots.set(pool.occupied() as i64);
                match result {
                    Ok(received) => {
                        metrics.connections_drained.inc();
                        metrics.bytes_received.inc_by(received as u64);
                    }
                    Err(err) if err.is_fatal() => {
                        error!(?err, %address, "buffer consistency violated");
                        let _ = fatal_sender.send(err);
                    }
                    Err(err) => {
                        metrics.connections_failed.inc();
                        warn!(?err, %address, "dropped connection");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks, signal::Signaler, tokio as TokioNetwork, Network as _};
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
    use tokio::{
        io::AsyncWriteExt as _,
        net::TcpStream,
        task::JoinHandle,
        time::timeout,
    };

    const ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 8080);
    const IDLE: Duration = Duration::from_secs(30);
    const TICK: Duration = Duration::from_millis(1);

    struct Harness {
        network: mocks::Network,
        address: SocketAddr,
        pool: SlotPool<mocks::Connection>,
        recorder: mocks::Recorder,
        registry: Registry,
        signaler: Signaler,
        server: JoinHandle<Result<(), Error>>,
    }

    impl Harness {
        fn metrics(&self) -> String {
            let mut encoded = String::new();
            encode(&mut encoded, &self.registry).unwrap();
            encoded
        }
    }

    async fn start(slots: usize, initial: usize, limit: usize) -> Harness {
        let network = mocks::Network::default();
        let address = SocketAddr::from(ADDRESS);
        let listener = network.bind(address, 64).await.unwrap();
        let cfg = Config {
            address,
            max_concurrent_requests: slots,
            initial_buffer_size: initial,
            max_buffer_size: limit,
            idle_timeout: IDLE,
            ..Config::default()
        };
        let recorder = mocks::Recorder::default();
        let mut registry = Registry::default();
        let server = Server::new(cfg, listener, recorder.clone(), &mut registry).unwrap();
        let pool = server.pool();
        let (signaler, signal) = Signaler::new();
        let server = tokio::spawn(server.run(signal));
        Harness {
            network,
            address,
            pool,
            recorder,
            registry,
            signaler,
            server,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connections_isolated() {
        let harness = start(4, 64, 1 << 20).await;
        let mut rng = StdRng::seed_from_u64(0);

        // Dial every client before any sends
        let clients: Vec<_> = (0..4)
            .map(|_| harness.network.dial(harness.address).unwrap())
            .collect();
        let payloads: Vec<Vec<u8>> = (0..4)
            .map(|_| {
                let mut payload = vec![0u8; rng.gen_range(100..3000)];
                rng.fill_bytes(&mut payload);
                payload
            })
            .collect();

        // Interleave chunks across connections
        let mut offsets = [0usize; 4];
        while offsets.iter().zip(&payloads).any(|(o, p)| *o < p.len()) {
            let i = rng.gen_range(0..4);
            let end = (offsets[i] + rng.gen_range(1..200)).min(payloads[i].len());
            clients[i].send(&payloads[i][offsets[i]..end]);
            offsets[i] = end;
            sleep(TICK).await;
        }
        sleep(TICK).await;

        // Every connection is live at once and holds exactly its own bytes
        assert_eq!(harness.pool.occupied(), 4);
        for index in 0..4 {
            let handle = harness.pool.slot(index).unwrap().lock().await;
            let buffer = handle.buffer().unwrap();
            let client = (buffer.peer().address().port() - 32768) as usize;
            assert_eq!(buffer.as_slice(), &payloads[client][..]);
        }

        // Closing reports each connection with its own bytes
        for client in &clients {
            client.close();
        }
        let completed = harness.recorder.wait(4).await;
        for (address, _, data) in completed {
            let client = (address.port() - 32768) as usize;
            assert_eq!(&data[..], &payloads[client][..]);
        }
        sleep(TICK).await;
        assert_eq!(harness.pool.occupied(), 0);
        assert!(harness.metrics().contains("connections_drained_total 4"));
        assert!(harness.metrics().contains("occupied_slots 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_bounded_by_slots() {
        let harness = start(2, 64, 1 << 20).await;

        let clients: Vec<_> = (0..5)
            .map(|_| harness.network.dial(harness.address).unwrap())
            .collect();
        sleep(TICK).await;

        // Only as many connections as slots are accepted
        assert_eq!(harness.pool.occupied(), 2);
        assert_eq!(harness.network.pending(harness.address), 3);

        // Each release admits exactly one more
        for (done, client) in clients.iter().enumerate() {
            client.send(&[done as u8; 10]);
            client.close();
            harness.recorder.wait(done + 1).await;
            sleep(TICK).await;
            let remaining = clients.len() - done - 1;
            assert_eq!(harness.pool.occupied(), remaining.min(2));
            assert_eq!(
                harness.network.pending(harness.address),
                remaining.saturating_sub(2)
            );
        }
        assert!(harness.metrics().contains("connections_accepted_total 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_holds_only_slot() {
        let harness = start(1, 1024, 1 << 20).await;

        // A connects and sends nothing
        let a = harness.network.dial(harness.address).unwrap();
        sleep(TICK).await;
        assert_eq!(harness.pool.occupied(), 1);

        // B waits in the backlog while A holds the slot
        let b = harness.network.dial(harness.address).unwrap();
        b.send(b"from b");
        sleep(IDLE / 2).await;
        assert_eq!(harness.network.pending(harness.address), 1);
        assert!(harness.recorder.connections().is_empty());

        // A's idle timeout frees the slot for B
        sleep(IDLE).await;
        assert_eq!(harness.network.pending(harness.address), 0);
        assert!(a.is_released());
        b.close();
        let completed = harness.recorder.wait(2).await;
        assert!(completed[0].2.is_empty());
        assert_eq!(&completed[1].2[..], b"from b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_stops_server() {
        let harness = start(2, 1024, 1 << 20).await;
        let healthy = harness.network.dial(harness.address).unwrap();
        healthy.send(b"fine");

        let faulty = harness.network.dial(harness.address).unwrap();
        faulty.withhold(100);
        faulty.send(&[3u8; 500]);

        let result = timeout(Duration::from_secs(1), harness.server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::ShortRead {
                expected: 500,
                actual: 400
            })
        ));
        assert!(harness.recorder.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_connection_dropped() {
        let harness = start(1, 16, 64).await;

        let oversized = harness.network.dial(harness.address).unwrap();
        oversized.send(&[1u8; 100]);
        sleep(TICK).await;
        assert!(oversized.is_released());

        // The server keeps accepting
        let next = harness.network.dial(harness.address).unwrap();
        next.send(b"small");
        next.close();
        let completed = harness.recorder.wait(1).await;
        assert_eq!(&completed[0].2[..], b"small");
        sleep(TICK).await;
        assert!(!harness.server.is_finished());
        assert!(harness.metrics().contains("connections_failed_total 1"));
        assert!(harness.metrics().contains("bytes_received_total 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_slot() {
        let mut harness = start(1, 1024, 1 << 20).await;
        let held = harness.network.dial(harness.address).unwrap();
        held.send(b"unfinished");
        sleep(TICK).await;
        assert_eq!(harness.pool.occupied(), 1);

        harness.signaler.signal(0);
        let result = timeout(Duration::from_secs(1), &mut harness.server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());

        // The aborted connection is closed and its slot vacated
        assert_eq!(harness.pool.occupied(), 0);
        assert!(held.is_released());
        assert!(harness.recorder.connections().is_empty());
        let mut metrics = String::new();
        encode(&mut metrics, &harness.registry).unwrap();
        assert!(metrics.contains("occupied_slots 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failures_recovered() {
        let harness = start(1, 1024, 1 << 20).await;
        harness.network.fail_accepts(harness.address, 3);
        sleep(ACCEPT_BACKOFF * 4).await;
        assert!(harness.metrics().contains("accept_failures_total 3"));
        assert_eq!(harness.pool.occupied(), 0);

        // The reserved slot was released after each failure and the next client is drained
        let client = harness.network.dial(harness.address).unwrap();
        client.send(b"xyz");
        client.close();
        let completed = harness.recorder.wait(1).await;
        assert_eq!(&completed[0].2[..], b"xyz");
        sleep(TICK).await;
        assert_eq!(harness.pool.occupied(), 0);
        assert!(!harness.server.is_finished());
        assert!(harness.metrics().contains("connections_accepted_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_connection_dropped() {
        let harness = start(1, 1024, 1 << 20).await;

        let reset = harness.network.dial(harness.address).unwrap();
        reset.send(b"half");
        sleep(TICK).await;
        reset.reset();
        sleep(TICK).await;
        assert!(reset.is_released());
        assert_eq!(harness.pool.occupied(), 0);

        // The server keeps accepting into the released slot
        let next = harness.network.dial(harness.address).unwrap();
        next.send(b"whole");
        next.close();
        let completed = harness.recorder.wait(1).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(&completed[0].2[..], b"whole");
        sleep(TICK).await;
        assert!(!harness.server.is_finished());
        assert!(harness.metrics().contains("connections_failed_total 1"));
        assert!(harness.metrics().contains("connections_drained_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_accepting() {
        let harness = start(1, 1024, 1 << 20).await;
        sleep(TICK).await;

        harness.signaler.signal(0);
        let result = timeout(Duration::from_secs(1), harness.server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let network = mocks::Network::default();
        let listener = network.bind(SocketAddr::from(ADDRESS), 1).await.unwrap();
        let cfg = Config {
            max_concurrent_requests: 0,
            ..Config::default()
        };
        let result = Server::new(
            cfg,
            listener,
            mocks::Recorder::default(),
            &mut Registry::default(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_tcp_two_chunks() {
        let network = TokioNetwork::Network::default();
        let listener = network
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)), 16)
            .await
            .unwrap();
        let cfg = Config {
            max_concurrent_requests: 2,
            initial_buffer_size: 1024,
            idle_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        let recorder = mocks::Recorder::default();
        let server =
            Server::new(cfg, listener, recorder.clone(), &mut Registry::default()).unwrap();
        let address = server.local_addr().unwrap();
        let (signaler, signal) = Signaler::new();
        let server = tokio::spawn(server.run(signal));

        // Send 2000 bytes in two chunks of 1000
        let sent: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&sent[..1000]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        stream.write_all(&sent[1000..]).await.unwrap();
        stream.shutdown().await.unwrap();

        let completed = timeout(Duration::from_secs(10), recorder.wait(1))
            .await
            .expect("connection not drained");
        let (_, capacity, data) = &completed[0];
        assert!(*capacity >= 2000);
        assert_eq!(data.len(), 2000);
        assert_eq!(&data[..], &sent[..]);

        signaler.signal(0);
        assert!(server.await.unwrap().is_ok());
    }
}
