//! Drain TCP connections into per-connection buffers behind a bounded slot pool.
//!
//! A [Server] reserves a free slot from its [SlotPool] before it accepts a connection, so at most
//! `max_concurrent_requests` connections are ever buffered at once. Each accepted connection is
//! wrapped in a [ConnectionBuffer] that lives inside its slot and is drained by a dedicated task
//! until the peer closes the connection or stays idle for too long.
//!
//! # Locking
//!
//! Every slot is guarded by a single lock. Holding it is the only way to mutate the slot's
//! buffer: the acceptor holds it while it populates the slot, a drain task holds it for each
//! probe-grow-read sequence, and [Slot::extract_range] holds it while it copies bytes out.
//! Drain tasks never hold the lock while waiting for the peer.
//!
//! # Networking
//!
//! The operating system is reached through the [Network], [Listener], and [Connection] traits.
//! [tokio] provides a production implementation and [mocks] provides an in-memory one (with
//! fault injection) for tests.

use std::{future::Future, io::Error as IoError, net::SocketAddr};
use thiserror::Error;

mod buffer;
pub use buffer::{grown_capacity, ConnectionBuffer, Peer};
mod config;
pub use config::{default_max_concurrent_requests, Config};
mod drain;
pub use drain::{drain, Handler, Reporter};
mod metrics;
mod network;
pub use network::{mocks, tokio};
mod pool;
pub use pool::{Slot, SlotHandle, SlotPool};
mod server;
pub use server::Server;
pub mod signal;

/// Errors that can occur while accepting and draining connections.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bind failed: {0}")]
    BindFailed(IoError),
    #[error("accept failed: {0}")]
    AcceptFailed(IoError),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("probe failed: {0}")]
    ProbeFailed(IoError),
    #[error("read failed: {0}")]
    ReadFailed(IoError),
    #[error("short read: probed {expected} bytes but read {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("buffer limit exceeded: need {needed} bytes, limit is {limit}")]
    BufferLimitExceeded { needed: usize, limit: usize },
    #[error("invalid range: [{lo}, {hi}] of {length} bytes")]
    InvalidRange { lo: usize, hi: usize, length: usize },
    #[error("slot vacant")]
    SlotVacant,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Returns true if the error means buffer state can no longer be trusted.
    ///
    /// Fatal errors stop the [Server]. Every other error only affects the connection
    /// it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ShortRead { .. })
    }
}

/// What a [Connection] has to offer once it becomes ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte can be read without blocking.
    Data,
    /// The peer closed its side of the connection and every byte has been read.
    Closed,
}

/// Interface that any network implementation must provide to bind listeners.
pub trait Network: Clone + Send + Sync + 'static {
    /// The type of [Listener] that's returned when binding to a socket.
    type Listener: Listener;

    /// Bind to the given socket address, queueing at most `backlog` pending connections.
    ///
    /// Failure indicates misconfiguration and is not retried.
    fn bind(
        &self,
        socket: SocketAddr,
        backlog: u32,
    ) -> impl Future<Output = Result<Self::Listener, Error>> + Send;
}

/// Interface that any network implementation must provide to accept connections.
pub trait Listener: Send + 'static {
    /// The type of [Connection] that's returned when accepting a peer.
    type Connection: Connection;

    /// Accept an incoming connection, waiting until one arrives.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(SocketAddr, Self::Connection), Error>> + Send;

    /// Returns the local address of the listener.
    fn local_addr(&self) -> Result<SocketAddr, IoError>;
}

/// Interface that any network implementation must provide to read from an accepted peer.
///
/// All methods take `&self` so that a drain task can wait for readiness while the
/// connection's buffer stays available to other lock holders.
pub trait Connection: Send + Sync + 'static {
    /// Returns the number of bytes that can be read right now without blocking.
    fn available(&self) -> Result<usize, Error>;

    /// Read up to `buf.len()` bytes without blocking, returning how many were read.
    fn read(&self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Wait until the connection has bytes to read or the peer has closed it.
    fn ready(&self) -> impl Future<Output = Result<Readiness, Error>> + Send;
}
