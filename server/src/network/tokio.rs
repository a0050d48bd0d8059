use crate::{Error, Readiness};
use std::{
    io::{Error as IoError, ErrorKind},
    net::SocketAddr,
    os::fd::AsRawFd,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::warn;

/// Implementation of [crate::Connection] for the [tokio] runtime.
pub struct Connection {
    stream: TcpStream,
}

impl crate::Connection for Connection {
    fn available(&self) -> Result<usize, Error> {
        let mut available: libc::c_int = 0;

        // SAFETY: the descriptor is owned by `stream` for the duration of the call and
        // FIONREAD writes a single `c_int` through the provided pointer.
        let result = unsafe {
            libc::ioctl(
                self.stream.as_raw_fd(),
                libc::FIONREAD,
                &mut available as *mut libc::c_int,
            )
        };
        if result == -1 {
            return Err(Error::ProbeFailed(IoError::last_os_error()));
        }
        Ok(available.max(0) as usize)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.stream.try_read(buf) {
            Ok(read) => Ok(read),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::ReadFailed(err)),
        }
    }

    async fn ready(&self) -> Result<Readiness, Error> {
        // Peeking waits for data without consuming it and returns 0 once the peer has closed
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte).await {
            Ok(0) => Ok(Readiness::Closed),
            Ok(_) => Ok(Readiness::Data),
            Err(err) => Err(Error::ReadFailed(err)),
        }
    }
}

/// Implementation of [crate::Listener] using the [tokio] runtime.
pub struct Listener {
    cfg: Config,
    listener: TcpListener,
}

impl crate::Listener for Listener {
    type Connection = Connection;

    async fn accept(&mut self) -> Result<(SocketAddr, Self::Connection), Error> {
        // Accept a new TCP stream
        let (stream, addr) = self.listener.accept().await.map_err(Error::AcceptFailed)?;

        // Set TCP_NODELAY if configured
        if let Some(tcp_nodelay) = self.cfg.tcp_nodelay {
            if let Err(err) = stream.set_nodelay(tcp_nodelay) {
                warn!(?err, "failed to set TCP_NODELAY");
            }
        }

        Ok((addr, Connection { stream }))
    }

    fn local_addr(&self) -> Result<SocketAddr, IoError> {
        self.listener.local_addr()
    }
}

/// Configuration for the tokio [Network] implementation of the [crate::Network] trait.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Whether or not to disable Nagle's algorithm on accepted connections.
    ///
    /// Note: Make sure that your compile target has and allows this configuration otherwise
    /// panics or unexpected behaviours are possible.
    tcp_nodelay: Option<bool>,
}

impl Config {
    /// See [Config]
    pub const fn with_tcp_nodelay(mut self, tcp_nodelay: Option<bool>) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// See [Config]
    pub const fn tcp_nodelay(&self) -> Option<bool> {
        self.tcp_nodelay
    }
}

/// [crate::Network] implementation that uses the [tokio] runtime.
#[derive(Clone, Debug, Default)]
pub struct Network {
    cfg: Config,
}

impl From<Config> for Network {
    fn from(cfg: Config) -> Self {
        Self { cfg }
    }
}

impl crate::Network for Network {
    type Listener = Listener;

    async fn bind(&self, socket: SocketAddr, backlog: u32) -> Result<Self::Listener, Error> {
        let tcp = if socket.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(Error::BindFailed)?;
        tcp.set_reuseaddr(true).map_err(Error::BindFailed)?;
        tcp.bind(socket).map_err(Error::BindFailed)?;
        let listener = tcp.listen(backlog).map_err(Error::BindFailed)?;
        Ok(Listener {
            cfg: self.cfg.clone(),
            listener,
        })
    }
}
