//! UDP socket construction.
//!
//! Sockets are created through socket2 so that broadcast reception and
//! address reuse can be configured before binding, then handed over as
//! non-blocking `std::net::UdpSocket`s ready for registration with tokio.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

use crate::transport::SocketOptions;

/// Bind a non-blocking UDP socket on `addr`
///
/// # Examples
/// ```no_run
/// use lidarlink_transport::udp::bind_udp;
/// use lidarlink_transport::SocketOptions;
/// use std::net::SocketAddr;
///
/// let addr: SocketAddr = "0.0.0.0:55000".parse().unwrap();
/// let socket = bind_udp(addr, &SocketOptions::broadcast_listener()).unwrap();
/// println!("Listening on {}", socket.local_addr().unwrap());
/// ```
pub fn bind_udp(addr: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Required for registration with the async reactor
    socket.set_nonblocking(true)?;

    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if options.broadcast {
        socket.set_broadcast(true)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }

    socket.bind(&addr.into())?;

    Ok(socket.into())
}
