use crate::Error;
use std::{
    net::{Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

/// Slots per worker thread when `max_concurrent_requests` is not set explicitly.
const REQUESTS_PER_WORKER: usize = 100;

/// Returns the default number of slots for `worker_threads` workers.
pub fn default_max_concurrent_requests(worker_threads: usize) -> usize {
    worker_threads.saturating_mul(REQUESTS_PER_WORKER)
}

/// Configuration for a [crate::Server].
///
/// Read once at startup and never modified afterwards.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the listener binds to.
    pub address: SocketAddr,

    /// Maximum number of connections the operating system queues before they are accepted.
    pub backlog: u32,

    /// Number of runtime worker threads that drain connections.
    pub worker_threads: usize,

    /// Maximum number of connections buffered at once (the number of slots).
    ///
    /// Connections beyond this bound wait in the listen backlog until a slot is released.
    pub max_concurrent_requests: usize,

    /// Capacity of a connection's buffer when it is accepted.
    pub initial_buffer_size: usize,

    /// Largest capacity a connection's buffer may grow to.
    ///
    /// A connection that sends more than this is dropped.
    pub max_buffer_size: usize,

    /// Duration a connection may go without sending any bytes before it is considered
    /// drained and its slot is released.
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let worker_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            backlog: 500,
            worker_threads,
            max_concurrent_requests: default_max_concurrent_requests(worker_threads),
            initial_buffer_size: 1024,
            max_buffer_size: 16 * 1024 * 1024, // 16 MB
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Returns an error if the configuration cannot be used to run a server.
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_threads == 0 {
            return Err(Error::InvalidConfig("worker_threads must be greater than 0"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_requests must be greater than 0",
            ));
        }
        if self.initial_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "initial_buffer_size must be greater than 0",
            ));
        }
        if self.initial_buffer_size > self.max_buffer_size {
            return Err(Error::InvalidConfig(
                "initial_buffer_size must not exceed max_buffer_size",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("idle_timeout must be greater than 0"));
        }
        Ok(())
    }
}
