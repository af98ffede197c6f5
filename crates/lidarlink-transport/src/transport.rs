//! Reactor abstraction shared by discovery and the command channel.
//!
//! A [`Reactor`] owns a set of UDP sockets, each identified by a
//! [`SocketToken`]. Consumers register sockets, send through them, and get
//! their datagrams back as [`IoEvent`]s together with a periodic timer tick.
//! Removing a socket closes it immediately, so its port can be rebound by
//! the next registration.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address binding failed
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        /// Address that could not be bound
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Token does not name a registered socket
    #[error("Unknown socket: {0}")]
    UnknownSocket(SocketToken),

    /// Reactor is shut down
    #[error("Transport is closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Identifies one socket registered with a [`Reactor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketToken(pub u64);

impl fmt::Display for SocketToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options applied when a socket is bound
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Set `SO_REUSEADDR`
    pub reuse_address: bool,
    /// Set `SO_BROADCAST`
    pub broadcast: bool,
    /// Requested kernel receive buffer size
    pub recv_buffer_size: Option<usize>,
    /// Requested kernel send buffer size
    pub send_buffer_size: Option<usize>,
}

impl SocketOptions {
    /// Options for a socket listening on a shared broadcast port
    pub fn broadcast_listener() -> Self {
        Self {
            reuse_address: true,
            broadcast: true,
            ..Self::default()
        }
    }

    /// Options for a per-device command socket
    pub fn unicast() -> Self {
        Self::default()
    }
}

/// Something the reactor has to report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// One datagram arrived on a registered socket
    Datagram {
        /// Receiving socket
        token: SocketToken,
        /// Sender
        from: SocketAddr,
        /// Datagram contents
        data: Vec<u8>,
    },
    /// Periodic timer tick
    Timer(Instant),
}

/// Socket registry driven by a single-threaded event loop.
///
/// Implementations are not required to be thread-safe: every call happens
/// from the task that drives the loop.
pub trait Reactor {
    /// Bind a UDP socket on `addr` and register it for readiness
    fn add_socket(&mut self, addr: SocketAddr, options: &SocketOptions)
    -> TransportResult<SocketToken>;

    /// Deregister and close a socket. Returns false if it was not registered.
    fn remove_socket(&mut self, token: SocketToken) -> bool;

    /// Send one datagram through a registered socket without blocking
    fn send_to(&mut self, token: SocketToken, buf: &[u8], dst: SocketAddr)
    -> TransportResult<usize>;

    /// Local address of a registered socket
    fn local_addr(&self, token: SocketToken) -> TransportResult<SocketAddr>;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
