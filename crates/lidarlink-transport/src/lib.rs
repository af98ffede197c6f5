//! # LidarLink Transport
//!
//! UDP transport layer for the LidarLink control plane.
//!
//! This crate provides:
//! - Socket construction with broadcast and address-reuse options
//! - The [`Reactor`] contract: register sockets, send, receive, timer ticks
//! - [`IoLoop`], a tokio-backed reactor driven by a single task
//! - Local interface lookup for subnet matching

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod io_loop;
pub mod netif;
pub mod transport;
pub mod udp;

use std::time::Duration;

pub use io_loop::IoLoop;
pub use netif::{find_local_ip, same_subnet};
pub use transport::{
    IoEvent, Reactor, SocketOptions, SocketToken, TransportError, TransportResult,
    TransportStats,
};

/// Default period of the reactor timer
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_millis(100);

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Period of [`IoEvent::Timer`] ticks
    pub timer_interval: Duration,
    /// Size of the shared receive buffer; longer datagrams are truncated
    pub max_datagram_size: usize,
    /// Kernel receive buffer size (system default if unset)
    pub recv_buffer_size: Option<usize>,
    /// Kernel send buffer size (system default if unset)
    pub send_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timer_interval: DEFAULT_TIMER_INTERVAL,
            max_datagram_size: 2048,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}
