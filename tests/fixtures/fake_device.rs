//! Fake device fixture for end-to-end testing
//!
//! Plays the device side of the control protocol over loopback:
//! - Announcing itself with broadcasts
//! - Answering the handshake
//! - Answering heartbeats and commands
//!
//! # Example
//!
//! ```no_run
//! use lidarlink_core::{BroadcastCode, DeviceType};
//! use lidarlink_integration_tests::fixtures::FakeDevice;
//!
//! # async fn run(listen: std::net::SocketAddr) -> std::io::Result<()> {
//! let code = BroadcastCode::parse("0TFDFG700601881").unwrap();
//! let mut device = FakeDevice::bind(code, DeviceType::Mid40).await?;
//! let request = device.accept_handshake(listen, 0).await?;
//! println!("host command port {}", request.cmd_port);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use lidarlink_core::{
    BroadcastBody, BroadcastCode, CommandSet, DeviceType, GeneralCommand, HandshakeRequest,
    HeartbeatResponse, HubCommand, HubQueryLidarInformationResponse, MAX_PACKET_SIZE, Packet,
    PacketBuilder, PacketType,
};
use lidarlink_discovery::ServiceConfig;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};

/// Time to wait for any single expected packet
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Gap between re-announcements while waiting for a handshake
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// Port base allocator for concurrent test execution
static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(0);

/// Allocate a port base whose negotiated ports do not overlap other tests
fn allocate_port_base() -> u16 {
    // Spread test binaries apart; each test gets a 16-port window
    let process_offset = (std::process::id() % 64) as u16 * 256;
    let index = NEXT_PORT_BASE.fetch_add(16, Ordering::SeqCst) % 256;
    20000 + process_offset + index
}

/// Service configuration bound to loopback with short timers.
///
/// The listener takes an ephemeral port; negotiated ports come from a
/// per-test range.
pub fn loopback_service_config() -> ServiceConfig {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut config = ServiceConfig::default();

    config.transport.timer_interval = Duration::from_millis(20);

    config.discovery.listen_addr = SocketAddr::new(localhost, 0);
    config.discovery.bind_ip = localhost;
    config.discovery.port_base = allocate_port_base();
    config.discovery.handshake_timeout = Duration::from_millis(500);

    config.channel.bind_ip = localhost;
    config.channel.heartbeat_interval = Duration::from_millis(100);
    config.channel.heartbeat_timeout = Duration::from_millis(400);
    config.channel.command_timeout = Duration::from_millis(300);

    config
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn build(
    packet_type: PacketType,
    sequence: u16,
    set: CommandSet,
    id: u8,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    PacketBuilder::new()
        .packet_type(packet_type)
        .sequence(sequence)
        .command(set, id)
        .payload(payload)
        .build()
        .map_err(|e| invalid(e.to_string()))
}

/// A packet received by the fake device
#[derive(Debug, Clone)]
pub struct Received {
    /// Sender
    pub from: SocketAddr,
    /// Packet type
    pub packet_type: PacketType,
    /// Sequence number
    pub sequence: u16,
    /// Command set
    pub command_set: CommandSet,
    /// Command id
    pub command_id: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Received {
    fn is(&self, set: CommandSet, id: u8) -> bool {
        self.command_set == set && self.command_id == id
    }
}

/// Device side of the control protocol on one loopback socket
pub struct FakeDevice {
    socket: UdpSocket,
    code: BroadcastCode,
    device_type: DeviceType,
    host: Option<SocketAddr>,
}

impl FakeDevice {
    /// Bind a device on an ephemeral loopback port
    pub async fn bind(code: BroadcastCode, device_type: DeviceType) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            socket,
            code,
            device_type,
            host: None,
        })
    }

    /// Address broadcasts are sent from
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Host command socket learned from the handshake
    pub fn host(&self) -> Option<SocketAddr> {
        self.host
    }

    /// Send one broadcast to `listener`
    pub async fn announce(&self, listener: SocketAddr) -> io::Result<()> {
        let body = BroadcastBody {
            broadcast_code: self.code,
            device_type: self.device_type,
        };
        let packet = build(
            PacketType::Msg,
            0,
            CommandSet::General,
            GeneralCommand::Broadcast as u8,
            &body.encode(),
        )?;
        self.socket.send_to(&packet, listener).await?;
        Ok(())
    }

    /// Receive and decode the next packet within `wait`
    pub async fn recv_within(&self, wait: Duration) -> io::Result<Received> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, from) = timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no packet received"))??;

        let packet = Packet::decode(&buf[..len]).map_err(|e| invalid(e.to_string()))?;
        Ok(Received {
            from,
            packet_type: packet.packet_type(),
            sequence: packet.sequence(),
            command_set: packet.command_set(),
            command_id: packet.command_id(),
            payload: packet.payload().to_vec(),
        })
    }

    /// Wait for a packet carrying `(set, id)`, ignoring everything else
    pub async fn expect_command(&self, set: CommandSet, id: u8) -> io::Result<Received> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = self.recv_within(remaining).await?;
            if received.is(set, id) {
                return Ok(received);
            }
        }
    }

    /// Announce until the host sends a handshake, then answer with `ret_code`.
    ///
    /// Returns the decoded handshake request.
    pub async fn accept_handshake(
        &mut self,
        listener: SocketAddr,
        ret_code: u8,
    ) -> io::Result<HandshakeRequest> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no handshake"));
            }
            self.announce(listener).await?;

            let received = match self.recv_within(ANNOUNCE_INTERVAL).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            };
            if !received.is(CommandSet::General, GeneralCommand::Handshake as u8) {
                continue;
            }

            let request =
                HandshakeRequest::decode(&received.payload).map_err(|e| invalid(e.to_string()))?;
            self.reply(&received, &[ret_code]).await?;
            if ret_code == 0 {
                self.host = Some(received.from);
            }
            return Ok(request);
        }
    }

    /// Answer the next heartbeat with `response`
    pub async fn answer_heartbeat(&self, response: &HeartbeatResponse) -> io::Result<Received> {
        let heartbeat = self
            .expect_command(CommandSet::General, GeneralCommand::Heartbeat as u8)
            .await?;
        self.reply(&heartbeat, &response.encode()).await?;
        Ok(heartbeat)
    }

    /// Answer the next hub member query with `response`
    pub async fn answer_hub_query(
        &self,
        response: &HubQueryLidarInformationResponse,
    ) -> io::Result<Received> {
        let query = self
            .expect_command(CommandSet::Hub, HubCommand::QueryLidarInformation as u8)
            .await?;
        self.reply(&query, &response.encode()).await?;
        Ok(query)
    }

    /// Send an ack echoing the request's sequence and command
    pub async fn reply(&self, request: &Received, payload: &[u8]) -> io::Result<()> {
        let packet = build(
            PacketType::Ack,
            request.sequence,
            request.command_set,
            request.command_id,
            payload,
        )?;
        self.socket.send_to(&packet, request.from).await?;
        Ok(())
    }
}
