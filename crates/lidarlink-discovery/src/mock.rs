//! In-memory reactor for unit tests.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;

use lidarlink_transport::{
    Reactor, SocketOptions, SocketToken, TransportError, TransportResult,
};

/// One datagram handed to [`MockReactor::send_to`]
#[derive(Debug, Clone)]
pub struct Sent {
    pub token: SocketToken,
    pub data: Vec<u8>,
    pub dst: SocketAddr,
}

/// Records binds, sends and removals instead of touching the network
#[derive(Debug, Default)]
pub struct MockReactor {
    next_token: u64,
    pub sockets: BTreeMap<SocketToken, (SocketAddr, SocketOptions)>,
    pub sent: Vec<Sent>,
    pub removed: Vec<SocketToken>,
    pub fail_bind: bool,
    pub fail_send: bool,
}

impl MockReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_sent(&mut self) -> Vec<Sent> {
        std::mem::take(&mut self.sent)
    }

    /// Token of the socket bound on `port`
    pub fn token_for_port(&self, port: u16) -> Option<SocketToken> {
        self.sockets
            .iter()
            .find(|(_, (addr, _))| addr.port() == port)
            .map(|(&token, _)| token)
    }
}

impl Reactor for MockReactor {
    fn add_socket(
        &mut self,
        addr: SocketAddr,
        options: &SocketOptions,
    ) -> TransportResult<SocketToken> {
        if self.fail_bind {
            return Err(TransportError::BindFailed {
                addr,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        let token = SocketToken(self.next_token);
        self.next_token += 1;
        self.sockets.insert(token, (addr, options.clone()));
        Ok(token)
    }

    fn remove_socket(&mut self, token: SocketToken) -> bool {
        let removed = self.sockets.remove(&token).is_some();
        if removed {
            self.removed.push(token);
        }
        removed
    }

    fn send_to(
        &mut self,
        token: SocketToken,
        buf: &[u8],
        dst: SocketAddr,
    ) -> TransportResult<usize> {
        if !self.sockets.contains_key(&token) {
            return Err(TransportError::UnknownSocket(token));
        }
        if self.fail_send {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::WouldBlock)));
        }
        self.sent.push(Sent {
            token,
            data: buf.to_vec(),
            dst,
        });
        Ok(buf.len())
    }

    fn local_addr(&self, token: SocketToken) -> TransportResult<SocketAddr> {
        self.sockets
            .get(&token)
            .map(|(addr, _)| *addr)
            .ok_or(TransportError::UnknownSocket(token))
    }
}
