//! In-memory implementation of the network traits.
//!
//! A [Client] writes bytes that the paired server-side [Connection] reads. Every dial goes
//! through a bound [Listener]'s backlog, which tests can inspect with [Network::pending] to
//! observe connections that have not been accepted yet. Clients can also [Client::withhold]
//! bytes from the next read to simulate a read that returns less than was probed, or
//! [Client::reset] the connection so that reads fail. [Network::fail_accepts] makes a
//! listener's next accepts fail.
//! A [Recorder] collects every connection a server finishes draining.

use crate::{ConnectionBuffer, Error, Readiness};
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    io::{Error as IoError, ErrorKind},
    net::{Ipv4Addr, SocketAddr},
    ops::Range,
    sync::{Arc, Mutex},
};
use tokio::sync::Notify;

/// Range of ephemeral ports assigned to dialers.
const EPHEMERAL_PORT_RANGE: Range<u16> = 32768..61000;

/// Address assigned to dialers.
const DIALER_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

#[derive(Default)]
struct State {
    data: VecDeque<u8>,
    closed: bool,
    released: bool,
    reset: bool,
    withheld: Option<usize>,
}

/// One direction of an in-memory connection.
#[derive(Default)]
struct Pipe {
    state: Mutex<State>,
    notify: Notify,
}

/// Create a connected [Client] and [Connection] pair that is not associated with any listener.
pub fn pipe() -> (Client, Connection) {
    let pipe = Arc::new(Pipe::default());
    (Client { pipe: pipe.clone() }, Connection { pipe })
}

/// Dialing side of an in-memory connection.
///
/// Dropping the client closes the connection.
pub struct Client {
    pipe: Arc<Pipe>,
}

impl Client {
    /// Make `data` available to the server side.
    pub fn send(&self, data: &[u8]) {
        self.pipe.state.lock().unwrap().data.extend(data);
        self.pipe.notify.notify_waiters();
    }

    /// Close the connection. Bytes already sent can still be read.
    pub fn close(&self) {
        self.pipe.state.lock().unwrap().closed = true;
        self.pipe.notify.notify_waiters();
    }

    /// Make the next read return `count` fewer bytes than requested.
    pub fn withhold(&self, count: usize) {
        self.pipe.state.lock().unwrap().withheld = Some(count);
    }

    /// Reset the connection. Every later read or readiness check on the server side fails.
    pub fn reset(&self) {
        self.pipe.state.lock().unwrap().reset = true;
        self.pipe.notify.notify_waiters();
    }

    /// Returns true once the server side of the connection has been dropped.
    pub fn is_released(&self) -> bool {
        self.pipe.state.lock().unwrap().released
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Implementation of [crate::Connection] for a mock [Network].
pub struct Connection {
    pipe: Arc<Pipe>,
}

impl crate::Connection for Connection {
    fn available(&self) -> Result<usize, Error> {
        Ok(self.pipe.state.lock().unwrap().data.len())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut state = self.pipe.state.lock().unwrap();
        if state.reset {
            return Err(Error::ReadFailed(IoError::from(ErrorKind::ConnectionReset)));
        }
        let withheld = state.withheld.take().unwrap_or(0);
        let read = buf.len().min(state.data.len()).saturating_sub(withheld);
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..read)) {
            *dst = src;
        }
        Ok(read)
    }

    async fn ready(&self) -> Result<Readiness, Error> {
        loop {
            // Register before checking so a concurrent send is not missed
            let notified = self.pipe.notify.notified();
            {
                let state = self.pipe.state.lock().unwrap();
                if state.reset {
                    return Err(Error::ReadFailed(IoError::from(ErrorKind::ConnectionReset)));
                }
                if !state.data.is_empty() {
                    return Ok(Readiness::Data);
                }
                if state.closed {
                    return Ok(Readiness::Closed);
                }
            }
            notified.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pipe.state.lock().unwrap().released = true;
    }
}

/// Connections dialed to a listener but not yet accepted.
struct Backlog {
    queue: Mutex<VecDeque<(SocketAddr, Connection)>>,
    capacity: usize,
    // Number of upcoming accepts that fail
    failures: Mutex<usize>,
    notify: Notify,
}

/// Implementation of [crate::Listener] for a mock [Network].
pub struct Listener {
    address: SocketAddr,
    backlog: Arc<Backlog>,
}

impl crate::Listener for Listener {
    type Connection = Connection;

    async fn accept(&mut self) -> Result<(SocketAddr, Self::Connection), Error> {
        loop {
            let notified = self.backlog.notify.notified();
            {
                let mut failures = self.backlog.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::AcceptFailed(IoError::from(
                        ErrorKind::ConnectionAborted,
                    )));
                }
            }
            let accepted = self.backlog.queue.lock().unwrap().pop_front();
            if let Some(accepted) = accepted {
                return Ok(accepted);
            }
            notified.await;
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, IoError> {
        Ok(self.address)
    }
}

/// In-memory implementation of [crate::Network].
///
/// Each dial is assigned a new ephemeral port from the range `32768..61000`. Ports are never
/// reused and the network panics once they are exhausted.
#[derive(Clone)]
pub struct Network {
    ephemeral: Arc<Mutex<u16>>,
    listeners: Arc<Mutex<HashMap<SocketAddr, Arc<Backlog>>>>,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            ephemeral: Arc::new(Mutex::new(EPHEMERAL_PORT_RANGE.start)),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Network {
    /// Connect to the listener bound at `socket`.
    ///
    /// Fails with [Error::ConnectionRefused] if nothing is bound there or its backlog is full.
    pub fn dial(&self, socket: SocketAddr) -> Result<Client, Error> {
        let backlog = self
            .listeners
            .lock()
            .unwrap()
            .get(&socket)
            .cloned()
            .ok_or(Error::ConnectionRefused)?;
        let mut queue = backlog.queue.lock().unwrap();
        if queue.len() >= backlog.capacity {
            return Err(Error::ConnectionRefused);
        }

        // Assign the dialer an ephemeral port
        let port = {
            let mut ephemeral = self.ephemeral.lock().unwrap();
            let port = *ephemeral;
            assert!(
                EPHEMERAL_PORT_RANGE.contains(&port),
                "ephemeral ports exhausted"
            );
            *ephemeral += 1;
            port
        };

        let (client, connection) = pipe();
        queue.push_back((SocketAddr::from((DIALER_IP, port)), connection));
        drop(queue);
        backlog.notify.notify_waiters();
        Ok(client)
    }

    /// Make the next `count` accepts on the listener bound at `socket` fail.
    pub fn fail_accepts(&self, socket: SocketAddr, count: usize) {
        let Some(backlog) = self.listeners.lock().unwrap().get(&socket).cloned() else {
            return;
        };
        *backlog.failures.lock().unwrap() += count;
        backlog.notify.notify_waiters();
    }

    /// Returns the number of connections dialed to `socket` that have not been accepted.
    pub fn pending(&self, socket: SocketAddr) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(&socket)
            .map_or(0, |backlog| backlog.queue.lock().unwrap().len())
    }
}

impl crate::Network for Network {
    type Listener = Listener;

    async fn bind(&self, socket: SocketAddr, backlog: u32) -> Result<Self::Listener, Error> {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(&socket) {
            return Err(Error::BindFailed(IoError::from(ErrorKind::AddrInUse)));
        }
        let backlog = Arc::new(Backlog {
            queue: Mutex::new(VecDeque::new()),
            capacity: backlog as usize,
            failures: Mutex::new(0),
            notify: Notify::new(),
        });
        listeners.insert(socket, backlog.clone());
        Ok(Listener {
            address: socket,
            backlog,
        })
    }
}

/// A completed connection: the peer's address, the final buffer capacity, and the bytes received.
pub type Completed = (SocketAddr, usize, Bytes);

/// [crate::Handler] that records every connection drained to completion.
#[derive(Clone, Default)]
pub struct Recorder {
    completed: Arc<Mutex<Vec<Completed>>>,
    notify: Arc<Notify>,
}

impl Recorder {
    /// Returns the connections recorded so far, in completion order.
    pub fn connections(&self) -> Vec<Completed> {
        self.completed.lock().unwrap().clone()
    }

    /// Wait until at least `count` connections have been recorded.
    pub async fn wait(&self, count: usize) -> Vec<Completed> {
        loop {
            let notified = self.notify.notified();
            {
                let completed = self.completed.lock().unwrap();
                if completed.len() >= count {
                    return completed.clone();
                }
            }
            notified.await;
        }
    }
}

impl crate::Handler for Recorder {
    fn completed<C: crate::Connection>(&self, buffer: &ConnectionBuffer<C>) {
        self.completed.lock().unwrap().push((
            buffer.peer().address(),
            buffer.capacity(),
            Bytes::copy_from_slice(buffer.as_slice()),
        ));
        self.notify.notify_waiters();
    }
}
