//! Tokio-backed [`Reactor`] implementation.
//!
//! `IoLoop` owns every registered socket and a periodic interval. The task
//! that owns it calls [`IoLoop::next_event`] in a loop and dispatches the
//! result; since only that task ever touches the loop, handlers run one at a
//! time and need no locking of their own.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::TransportConfig;
use crate::transport::{
    IoEvent, Reactor, SocketOptions, SocketToken, TransportError, TransportResult,
    TransportStats,
};
use crate::udp::bind_udp;

/// Single-consumer event loop over a set of UDP sockets
pub struct IoLoop {
    sockets: BTreeMap<SocketToken, UdpSocket>,
    next_token: u64,
    // First token scanned on the next poll
    scan_from: SocketToken,
    timer: Interval,
    recv_buf: Vec<u8>,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    stats: TransportStats,
}

impl IoLoop {
    /// Create an empty loop. Must be called inside a tokio runtime.
    pub fn new(config: &TransportConfig) -> Self {
        let mut timer = tokio::time::interval(config.timer_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            sockets: BTreeMap::new(),
            next_token: 0,
            scan_from: SocketToken(0),
            timer,
            recv_buf: vec![0u8; config.max_datagram_size],
            recv_buffer_size: config.recv_buffer_size,
            send_buffer_size: config.send_buffer_size,
            stats: TransportStats::new(),
        }
    }

    /// Wait for the next datagram or timer tick.
    ///
    /// Cancel safe: a datagram is only taken off a socket when it is returned.
    pub async fn next_event(&mut self) -> IoEvent {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Poll for the next datagram or timer tick.
    ///
    /// Sockets are scanned round-robin, starting after the one served last.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<IoEvent> {
        if let Poll::Ready(tick) = self.timer.poll_tick(cx) {
            return Poll::Ready(IoEvent::Timer(tick.into_std()));
        }

        let Self {
            sockets,
            scan_from,
            recv_buf,
            stats,
            ..
        } = self;

        let start = *scan_from;
        for (&token, socket) in sockets.range(start..).chain(sockets.range(..start)) {
            loop {
                let mut buf = ReadBuf::new(&mut recv_buf[..]);
                match socket.poll_recv_from(cx, &mut buf) {
                    Poll::Ready(Ok(from)) => {
                        let data = buf.filled().to_vec();
                        stats.record_recv(data.len());
                        trace!(%token, %from, len = data.len(), "datagram received");
                        *scan_from = SocketToken(token.0 + 1);
                        return Poll::Ready(IoEvent::Datagram { token, from, data });
                    }
                    Poll::Ready(Err(e)) => {
                        // ICMP errors surface here on some platforms; keep draining
                        stats.record_recv_error();
                        debug!(%token, error = %e, "receive error");
                    }
                    Poll::Pending => break,
                }
            }
        }

        Poll::Pending
    }

    /// Number of registered sockets
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Change the timer period
    pub fn set_timer_interval(&mut self, period: Duration) {
        self.timer = tokio::time::interval(period);
        self.timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    /// Snapshot of transport counters
    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// Close every socket
    pub fn close_all(&mut self) {
        if !self.sockets.is_empty() {
            debug!(count = self.sockets.len(), "closing all sockets");
        }
        self.sockets.clear();
    }
}

impl Reactor for IoLoop {
    fn add_socket(
        &mut self,
        addr: SocketAddr,
        options: &SocketOptions,
    ) -> TransportResult<SocketToken> {
        let mut options = options.clone();
        options.recv_buffer_size = options.recv_buffer_size.or(self.recv_buffer_size);
        options.send_buffer_size = options.send_buffer_size.or(self.send_buffer_size);

        let std_socket = bind_udp(addr, &options)
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let socket = UdpSocket::from_std(std_socket)?;

        let token = SocketToken(self.next_token);
        self.next_token += 1;
        debug!(%token, local = ?socket.local_addr().ok(), "socket registered");
        self.sockets.insert(token, socket);
        Ok(token)
    }

    fn remove_socket(&mut self, token: SocketToken) -> bool {
        let removed = self.sockets.remove(&token).is_some();
        if removed {
            debug!(%token, "socket closed");
        }
        removed
    }

    fn send_to(
        &mut self,
        token: SocketToken,
        buf: &[u8],
        dst: SocketAddr,
    ) -> TransportResult<usize> {
        let socket = self
            .sockets
            .get(&token)
            .ok_or(TransportError::UnknownSocket(token))?;
        match socket.try_send_to(buf, dst) {
            Ok(sent) => {
                self.stats.record_send(sent);
                Ok(sent)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }

    fn local_addr(&self, token: SocketToken) -> TransportResult<SocketAddr> {
        let socket = self
            .sockets
            .get(&token)
            .ok_or(TransportError::UnknownSocket(token))?;
        Ok(socket.local_addr()?)
    }
}
