//! Device Discovery
//!
//! Listens for device broadcasts on the well-known port and runs the
//! handshake with whitelisted devices. Each handshake attempt is a
//! *candidate*: it owns a freshly bound command socket and lives until the
//! device acks or the handshake timeout passes, whichever comes first.
//!
//! Discovery is driven by a single task through [`DeviceDiscovery::on_data`]
//! and [`DeviceDiscovery::on_timer`]; it keeps no locks of its own.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lidarlink_core::{
    BroadcastBody, BroadcastInfo, CommandSet, DISCOVERY_PORT, DeviceInfo, GeneralCommand,
    HandshakeAck, HandshakeRequest, Packet, PacketBuilder, PacketIter, PacketType,
    SequenceGenerator,
};
use lidarlink_transport::{Reactor, SocketOptions, SocketToken, find_local_ip};
use tracing::{debug, info, trace, warn};

use crate::error::DiscoveryError;
use crate::manager::DeviceManager;

/// Default time a candidate waits for its handshake ack
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Broadcast listen address
    pub listen_addr: SocketAddr,
    /// Local address candidate sockets bind to
    pub bind_ip: IpAddr,
    /// Base of the negotiated port range
    pub port_base: u16,
    /// Command port offset from `port_base`
    pub cmd_port_offset: u16,
    /// Point data port offset from `port_base`
    pub data_port_offset: u16,
    /// Sensor data port offset from `port_base`
    pub sensor_port_offset: u16,
    /// Time a candidate waits for its handshake ack
    pub handshake_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DISCOVERY_PORT),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_base: DISCOVERY_PORT,
            cmd_port_offset: 500,
            data_port_offset: 1000,
            sensor_port_offset: 1000,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Picks the local address to announce to a device, `None` if no local
/// interface shares its subnet
pub type LocalIpResolver = Box<dyn Fn(Ipv4Addr) -> Option<Ipv4Addr> + Send>;

/// A device that completed its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    /// Record to admit, with negotiated ports filled in
    pub info: DeviceInfo,
    /// Address the device broadcast from
    pub remote: SocketAddr,
}

/// How a candidate ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Device accepted the handshake
    Promoted,
    /// Device answered with a nonzero return code
    Rejected(u8),
    /// No ack within the handshake timeout
    TimedOut,
    /// Discovery shut down first
    Abandoned,
}

/// Why a handshake was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAbort {
    /// No local interface shares the device's subnet
    SubnetMismatch,
    /// The configured port range is exhausted
    PortRangeExhausted,
    /// The candidate socket could not be bound
    BindFailed,
    /// The handshake request could not be sent
    SendFailed,
}

impl fmt::Display for HandshakeAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            HandshakeAbort::SubnetMismatch => "local IP and device IP are not in the same subnet",
            HandshakeAbort::PortRangeExhausted => "no port triple fits the configured range",
            HandshakeAbort::BindFailed => "failed to bind candidate socket",
            HandshakeAbort::SendFailed => "failed to send handshake request",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortTriple {
    cmd: u16,
    data: u16,
    sensor: u16,
}

#[derive(Debug)]
struct CandidateConnection {
    info: DeviceInfo,
    remote: SocketAddr,
    last_send: Instant,
}

/// Broadcast listener and handshake driver
pub struct DeviceDiscovery {
    config: DiscoveryConfig,
    manager: Arc<DeviceManager>,
    sequence: Arc<SequenceGenerator>,
    resolver: LocalIpResolver,
    listener: Option<SocketToken>,
    candidates: HashMap<SocketToken, CandidateConnection>,
    port_count: u16,
}

impl fmt::Debug for DeviceDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDiscovery")
            .field("config", &self.config)
            .field("listener", &self.listener)
            .field("candidates", &self.candidates.len())
            .field("port_count", &self.port_count)
            .finish_non_exhaustive()
    }
}

impl DeviceDiscovery {
    /// Create a stopped discovery that reports to `manager`
    pub fn new(
        config: DiscoveryConfig,
        manager: Arc<DeviceManager>,
        sequence: Arc<SequenceGenerator>,
    ) -> Self {
        Self {
            config,
            manager,
            sequence,
            resolver: Box::new(find_local_ip),
            listener: None,
            candidates: HashMap::new(),
            port_count: 0,
        }
    }

    /// Replace the interface lookup used for the subnet check
    pub fn with_local_ip_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(Ipv4Addr) -> Option<Ipv4Addr> + Send + 'static,
    {
        self.resolver = Box::new(resolver);
        self
    }

    /// Bind the broadcast listener.
    ///
    /// Does nothing if already started.
    pub fn start<R: Reactor + ?Sized>(&mut self, reactor: &mut R) -> Result<(), DiscoveryError> {
        if self.listener.is_some() {
            return Ok(());
        }

        if self.config.data_port_offset == self.config.sensor_port_offset {
            warn!(
                offset = self.config.data_port_offset,
                "data and sensor ports share one offset; each device gets the same port for both"
            );
        }

        let token = reactor
            .add_socket(self.config.listen_addr, &SocketOptions::broadcast_listener())
            .map_err(DiscoveryError::from_bind)?;
        self.listener = Some(token);
        info!(addr = %self.config.listen_addr, "discovery listening");
        Ok(())
    }

    /// True between [`start`](Self::start) and [`uninit`](Self::uninit)
    pub fn is_started(&self) -> bool {
        self.listener.is_some()
    }

    /// Bound address of the broadcast listener
    pub fn local_addr<R: Reactor + ?Sized>(&self, reactor: &R) -> Option<SocketAddr> {
        self.listener.and_then(|token| reactor.local_addr(token).ok())
    }

    /// True if `token` is the listener or a candidate socket
    pub fn owns(&self, token: SocketToken) -> bool {
        self.listener == Some(token) || self.candidates.contains_key(&token)
    }

    /// Number of handshakes awaiting an ack
    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Handle a datagram received on the listener or a candidate socket.
    ///
    /// Returns the device whose handshake this datagram completed, if any.
    pub fn on_data<R: Reactor + ?Sized>(
        &mut self,
        token: SocketToken,
        from: SocketAddr,
        data: &[u8],
        reactor: &mut R,
        now: Instant,
    ) -> Option<FoundDevice> {
        for packet in PacketIter::new(data) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) if e.is_crc_failure() => {
                    debug!(peer = %from, error = %e, "dropping corrupt datagram");
                    break;
                }
                Err(e) => {
                    debug!(peer = %from, error = %e, "dropping malformed datagram");
                    break;
                }
            };

            if packet.is_command(CommandSet::General, GeneralCommand::Broadcast as u8) {
                if self.listener == Some(token) {
                    self.on_broadcast(&packet, from, reactor, now);
                }
            } else if packet.is_command(CommandSet::General, GeneralCommand::Handshake as u8) {
                if self.candidates.contains_key(&token) {
                    return self.on_handshake_ack(token, &packet, reactor);
                }
            } else {
                trace!(peer = %from, command_id = packet.command_id(), "ignoring packet");
            }
        }
        None
    }

    fn on_broadcast<R: Reactor + ?Sized>(
        &mut self,
        packet: &Packet<'_>,
        from: SocketAddr,
        reactor: &mut R,
        now: Instant,
    ) {
        let body = match BroadcastBody::decode_lossy(packet.payload()) {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %from, error = %e, "malformed broadcast");
                return;
            }
        };
        let IpAddr::V4(ip) = from.ip() else {
            debug!(peer = %from, "ignoring broadcast from non-IPv4 peer");
            return;
        };
        let code = body.broadcast_code;
        trace!(broadcast_code = %code, peer = %from, "broadcast");

        self.manager.broadcast_observed(&BroadcastInfo {
            broadcast_code: code,
            device_type: body.device_type,
            ip,
        });

        if BroadcastBody::decode(packet.payload()).is_err() {
            debug!(
                broadcast_code = %code,
                peer = %from,
                "unprintable broadcast code, not admitting"
            );
            return;
        }
        let Some(handle) = self.manager.find_handle(&code) else {
            debug!(broadcast_code = %code, "broadcast code not whitelisted");
            return;
        };
        if self.manager.is_device_connected(handle) {
            return;
        }

        self.on_timer(now, reactor);
        if self
            .candidates
            .values()
            .any(|candidate| candidate.info.broadcast_code == code)
        {
            trace!(broadcast_code = %code, "handshake already pending");
            return;
        }

        let mut info = DeviceInfo::new(code, handle, body.device_type);
        info.ip = ip;
        match self.begin_handshake(info, from, reactor, now) {
            Ok(()) => {}
            Err(abort @ HandshakeAbort::SubnetMismatch) => {
                info!(broadcast_code = %code, peer = %from, "{abort}");
            }
            Err(abort) => {
                warn!(broadcast_code = %code, peer = %from, "{abort}");
            }
        }
    }

    fn begin_handshake<R: Reactor + ?Sized>(
        &mut self,
        mut info: DeviceInfo,
        remote: SocketAddr,
        reactor: &mut R,
        now: Instant,
    ) -> Result<(), HandshakeAbort> {
        let local_ip = (self.resolver)(info.ip).ok_or(HandshakeAbort::SubnetMismatch)?;
        let ports = self
            .allocate_ports()
            .ok_or(HandshakeAbort::PortRangeExhausted)?;
        info.cmd_port = ports.cmd;
        info.data_port = ports.data;
        info.sensor_port = ports.sensor;

        let addr = SocketAddr::new(self.config.bind_ip, ports.cmd);
        let token = reactor
            .add_socket(addr, &SocketOptions::unicast())
            .map_err(|e| {
                debug!(%addr, error = %e, "candidate bind failed");
                HandshakeAbort::BindFailed
            })?;

        let request = HandshakeRequest {
            ip: local_ip,
            data_port: ports.data,
            cmd_port: ports.cmd,
            sensor_port: ports.sensor,
        };
        let sent = PacketBuilder::new()
            .packet_type(PacketType::Ack)
            .sequence(self.sequence.next())
            .command(CommandSet::General, GeneralCommand::Handshake as u8)
            .payload(&request.encode())
            .build()
            .map_err(|e| debug!(error = %e, "failed to encode handshake"))
            .and_then(|packet| {
                reactor
                    .send_to(token, &packet, remote)
                    .map_err(|e| debug!(peer = %remote, error = %e, "handshake send failed"))
            });
        if sent.is_err() {
            reactor.remove_socket(token);
            return Err(HandshakeAbort::SendFailed);
        }

        info!(
            handle = info.handle,
            broadcast_code = %info.broadcast_code,
            %local_ip,
            cmd_port = ports.cmd,
            data_port = ports.data,
            "handshake sent"
        );
        self.candidates.insert(
            token,
            CandidateConnection {
                info,
                remote,
                last_send: now,
            },
        );
        Ok(())
    }

    fn on_handshake_ack<R: Reactor + ?Sized>(
        &mut self,
        token: SocketToken,
        packet: &Packet<'_>,
        reactor: &mut R,
    ) -> Option<FoundDevice> {
        let outcome = match HandshakeAck::decode(packet.payload()) {
            Ok(ack) if ack.is_success() => CandidateOutcome::Promoted,
            Ok(ack) => CandidateOutcome::Rejected(ack.ret_code),
            Err(e) => {
                debug!(error = %e, "malformed handshake ack");
                CandidateOutcome::Rejected(u8::MAX)
            }
        };

        let candidate = self.close_candidate(token, reactor, outcome)?;
        if outcome != CandidateOutcome::Promoted {
            return None;
        }

        let info = candidate.info;
        info!(
            handle = info.handle,
            broadcast_code = %info.broadcast_code,
            device_type = %info.device_type,
            ip = %info.ip,
            cmd_port = info.cmd_port,
            data_port = info.data_port,
            "new device"
        );
        Some(FoundDevice {
            info,
            remote: candidate.remote,
        })
    }

    fn close_candidate<R: Reactor + ?Sized>(
        &mut self,
        token: SocketToken,
        reactor: &mut R,
        outcome: CandidateOutcome,
    ) -> Option<CandidateConnection> {
        let candidate = self.candidates.remove(&token)?;
        reactor.remove_socket(token);
        debug!(
            handle = candidate.info.handle,
            broadcast_code = %candidate.info.broadcast_code,
            ?outcome,
            "candidate closed"
        );
        Some(candidate)
    }

    fn allocate_ports(&mut self) -> Option<PortTriple> {
        // One retry after wrapping the counter back to the start of the range
        for _ in 0..2 {
            self.port_count = self.port_count.wrapping_add(1).max(1);
            if let Some(ports) = self.ports_for(self.port_count) {
                return Some(ports);
            }
            self.port_count = 0;
        }
        None
    }

    fn ports_for(&self, n: u16) -> Option<PortTriple> {
        let at = |offset: u16| self.config.port_base.checked_add(offset)?.checked_add(n);
        Some(PortTriple {
            cmd: at(self.config.cmd_port_offset)?,
            data: at(self.config.data_port_offset)?,
            sensor: at(self.config.sensor_port_offset)?,
        })
    }

    /// Close every candidate older than the handshake timeout.
    ///
    /// Returns the number closed.
    pub fn on_timer<R: Reactor + ?Sized>(&mut self, now: Instant, reactor: &mut R) -> usize {
        let timeout = self.config.handshake_timeout;
        let expired: Vec<SocketToken> = self
            .candidates
            .iter()
            .filter(|(_, candidate)| now.duration_since(candidate.last_send) > timeout)
            .map(|(&token, _)| token)
            .collect();

        for &token in &expired {
            self.close_candidate(token, reactor, CandidateOutcome::TimedOut);
        }
        expired.len()
    }

    /// Close the listener and every candidate socket.
    ///
    /// Safe to call when already stopped.
    pub fn uninit<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        let tokens: Vec<SocketToken> = self.candidates.keys().copied().collect();
        for token in tokens {
            self.close_candidate(token, reactor, CandidateOutcome::Abandoned);
        }
        if let Some(token) = self.listener.take() {
            reactor.remove_socket(token);
            info!("discovery stopped");
        }
    }
}
