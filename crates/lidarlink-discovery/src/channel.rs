//! Per-device command channel.
//!
//! Every admitted device gets a unicast socket bound on its negotiated
//! command port. The channel sends queued commands through it, matches acks
//! to pending commands by sequence number, keeps the device alive with
//! periodic heartbeats and reports a device as lost once heartbeats stop
//! being answered.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lidarlink_core::{
    CommandSet, DeviceInfo, GeneralCommand, HeartbeatResponse, Packet, PacketBuilder, PacketIter,
    PacketType, SequenceGenerator,
};
use lidarlink_transport::{Reactor, SocketOptions, SocketToken, TransportResult};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dispatch::{CommandCallback, CommandDispatcher, CommandStatus};
use crate::error::DispatchError;

/// Default period between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default silence after which a device is considered lost
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time to wait for a command ack
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Command channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Local address command sockets bind to
    pub bind_ip: IpAddr,
    /// Device port commands are sent to; the broadcast source port if unset
    pub device_command_port: Option<u16>,
    /// Period between heartbeats
    pub heartbeat_interval: Duration,
    /// Silence after which a device is lost
    pub heartbeat_timeout: Duration,
    /// Time to wait for a command ack
    pub command_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            device_command_port: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// A command queued through a [`CommandHandle`]
pub struct CommandRequest {
    /// Target device
    pub handle: u8,
    /// Command set
    pub command_set: CommandSet,
    /// Command id within the set
    pub command_id: u8,
    /// Command body
    pub payload: Vec<u8>,
    /// Completion callback
    pub callback: CommandCallback,
}

impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("handle", &self.handle)
            .field("command_set", &self.command_set)
            .field("command_id", &self.command_id)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Cloneable sender side of a [`CommandChannel`]
#[derive(Debug, Clone)]
pub struct CommandHandle {
    tx: mpsc::UnboundedSender<CommandRequest>,
}

impl CommandDispatcher for CommandHandle {
    fn send_command(
        &self,
        handle: u8,
        command_set: CommandSet,
        command_id: u8,
        payload: Vec<u8>,
        callback: CommandCallback,
    ) -> Result<(), DispatchError> {
        self.tx
            .send(CommandRequest {
                handle,
                command_set,
                command_id,
                payload,
                callback,
            })
            .map_err(|_| DispatchError::ChannelClosed)
    }
}

/// Something the service loop has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A heartbeat was answered
    Heartbeat {
        /// Answering device
        handle: u8,
        /// Reported state
        response: HeartbeatResponse,
    },
    /// A device stopped answering and its channel was closed
    Lost(u8),
}

#[derive(Debug)]
struct DeviceChannel {
    token: SocketToken,
    remote: SocketAddr,
    last_heartbeat_sent: Option<Instant>,
    last_seen: Instant,
}

struct PendingCommand {
    handle: u8,
    command_set: CommandSet,
    command_id: u8,
    sequence: u16,
    deadline: Instant,
    callback: CommandCallback,
}

impl PendingCommand {
    fn matches(&self, handle: u8, packet: &Packet<'_>) -> bool {
        self.handle == handle
            && self.sequence == packet.sequence()
            && packet.is_command(self.command_set, self.command_id)
    }
}

/// Command sockets, pending commands and heartbeat bookkeeping
pub struct CommandChannel {
    config: ChannelConfig,
    sequence: Arc<SequenceGenerator>,
    devices: HashMap<u8, DeviceChannel>,
    tokens: HashMap<SocketToken, u8>,
    pending: Vec<PendingCommand>,
    tx: mpsc::UnboundedSender<CommandRequest>,
    rx: mpsc::UnboundedReceiver<CommandRequest>,
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl CommandChannel {
    /// Create a channel with no devices
    pub fn new(config: ChannelConfig, sequence: Arc<SequenceGenerator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            sequence,
            devices: HashMap::new(),
            tokens: HashMap::new(),
            pending: Vec::new(),
            tx,
            rx,
        }
    }

    /// A dispatcher that queues commands onto this channel
    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next queued command
    pub async fn next_request(&mut self) -> Option<CommandRequest> {
        self.rx.recv().await
    }

    /// Number of devices with an open channel
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of commands awaiting an ack
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True if `token` is one of this channel's command sockets
    pub fn owns(&self, token: SocketToken) -> bool {
        self.tokens.contains_key(&token)
    }

    /// Open a command socket for an admitted device.
    ///
    /// Binds `bind_ip:info.cmd_port`; commands go to `remote`, or to
    /// `device_command_port` on the same host when configured. An existing
    /// channel for the same handle is closed first.
    pub fn add_device<R: Reactor + ?Sized>(
        &mut self,
        info: &DeviceInfo,
        remote: SocketAddr,
        reactor: &mut R,
        now: Instant,
    ) -> TransportResult<()> {
        let handle = info.handle;
        if self.devices.contains_key(&handle) {
            self.remove_device(handle, reactor);
        }

        let remote = match self.config.device_command_port {
            Some(port) => SocketAddr::new(remote.ip(), port),
            None => remote,
        };
        let addr = SocketAddr::new(self.config.bind_ip, info.cmd_port);
        let token = reactor.add_socket(addr, &SocketOptions::unicast())?;
        self.tokens.insert(token, handle);
        self.devices.insert(
            handle,
            DeviceChannel {
                token,
                remote,
                last_heartbeat_sent: None,
                last_seen: now,
            },
        );
        debug!(handle, %addr, %remote, "command channel open");
        Ok(())
    }

    /// Close a device's command socket, failing its pending commands
    pub fn remove_device<R: Reactor + ?Sized>(&mut self, handle: u8, reactor: &mut R) -> bool {
        let Some(device) = self.devices.remove(&handle) else {
            return false;
        };
        self.tokens.remove(&device.token);
        reactor.remove_socket(device.token);
        self.fail_pending(|pending| pending.handle == handle, CommandStatus::NotConnected);
        debug!(handle, "command channel closed");
        true
    }

    fn fail_pending(&mut self, select: impl Fn(&PendingCommand) -> bool, status: CommandStatus) {
        let (failed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| select(pending));
        self.pending = kept;
        for pending in failed {
            trace!(handle = pending.handle, sequence = pending.sequence, %status, "command failed");
            (pending.callback)(status, &[]);
        }
    }

    /// Send a queued command.
    ///
    /// Unknown handles and send failures complete the callback immediately.
    pub fn process_request<R: Reactor + ?Sized>(
        &mut self,
        request: CommandRequest,
        reactor: &mut R,
        now: Instant,
    ) {
        let CommandRequest {
            handle,
            command_set,
            command_id,
            payload,
            callback,
        } = request;

        let Some(device) = self.devices.get(&handle) else {
            debug!(handle, "command for device without channel");
            callback(CommandStatus::NotConnected, &[]);
            return;
        };

        let sequence = self.sequence.next();
        let packet = match PacketBuilder::new()
            .packet_type(PacketType::Cmd)
            .sequence(sequence)
            .command(command_set, command_id)
            .payload(&payload)
            .build()
        {
            Ok(packet) => packet,
            Err(e) => {
                warn!(handle, error = %e, "failed to encode command");
                callback(CommandStatus::SendFailed, &[]);
                return;
            }
        };

        if let Err(e) = reactor.send_to(device.token, &packet, device.remote) {
            warn!(handle, error = %e, "failed to send command");
            callback(CommandStatus::SendFailed, &[]);
            return;
        }

        trace!(handle, sequence, ?command_set, command_id, "command sent");
        self.pending.push(PendingCommand {
            handle,
            command_set,
            command_id,
            sequence,
            deadline: now + self.config.command_timeout,
            callback,
        });
    }

    /// Handle a datagram received on a command socket
    pub fn on_data(&mut self, token: SocketToken, data: &[u8], now: Instant) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        let Some(&handle) = self.tokens.get(&token) else {
            return events;
        };

        for packet in PacketIter::new(data) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(handle, error = %e, "dropping malformed command datagram");
                    break;
                }
            };

            match packet.packet_type() {
                PacketType::Ack => self.on_ack(handle, &packet, now, &mut events),
                PacketType::Msg => on_message(handle, &packet),
                PacketType::Cmd => trace!(handle, "ignoring command sent by device"),
            }
        }

        events
    }

    fn on_ack(&mut self, handle: u8, packet: &Packet<'_>, now: Instant, events: &mut Vec<ChannelEvent>) {
        if let Some(device) = self.devices.get_mut(&handle) {
            device.last_seen = now;
        }

        if let Some(index) = self
            .pending
            .iter()
            .position(|pending| pending.matches(handle, packet))
        {
            let pending = self.pending.swap_remove(index);
            (pending.callback)(CommandStatus::Success, packet.payload());
            return;
        }

        if packet.is_command(CommandSet::General, GeneralCommand::Heartbeat as u8) {
            match HeartbeatResponse::decode(packet.payload()) {
                Ok(response) => events.push(ChannelEvent::Heartbeat { handle, response }),
                Err(e) => debug!(handle, error = %e, "malformed heartbeat ack"),
            }
            return;
        }

        trace!(handle, sequence = packet.sequence(), "unsolicited ack");
    }

    /// Expire commands, detect lost devices and send due heartbeats
    pub fn on_timer<R: Reactor + ?Sized>(&mut self, now: Instant, reactor: &mut R) -> Vec<ChannelEvent> {
        self.fail_pending(|pending| pending.deadline <= now, CommandStatus::Timeout);

        let timeout = self.config.heartbeat_timeout;
        let lost: Vec<u8> = self
            .devices
            .iter()
            .filter(|(_, device)| now.duration_since(device.last_seen) >= timeout)
            .map(|(&handle, _)| handle)
            .collect();

        let mut events = Vec::with_capacity(lost.len());
        for handle in lost {
            warn!(handle, "device stopped answering heartbeats");
            self.remove_device(handle, reactor);
            events.push(ChannelEvent::Lost(handle));
        }

        let interval = self.config.heartbeat_interval;
        for (&handle, device) in &mut self.devices {
            let due = device
                .last_heartbeat_sent
                .is_none_or(|sent| now.duration_since(sent) >= interval);
            if !due {
                continue;
            }

            let packet = PacketBuilder::new()
                .packet_type(PacketType::Cmd)
                .sequence(self.sequence.next())
                .command(CommandSet::General, GeneralCommand::Heartbeat as u8)
                .build();
            match packet {
                Ok(packet) => {
                    if let Err(e) = reactor.send_to(device.token, &packet, device.remote) {
                        debug!(handle, error = %e, "failed to send heartbeat");
                    }
                }
                Err(e) => debug!(handle, error = %e, "failed to encode heartbeat"),
            }
            device.last_heartbeat_sent = Some(now);
        }

        events
    }

    /// Close every device channel and fail every outstanding command
    pub fn close<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        let handles: Vec<u8> = self.devices.keys().copied().collect();
        for handle in handles {
            self.remove_device(handle, reactor);
        }
        self.fail_pending(|_| true, CommandStatus::NotConnected);
        while let Ok(request) = self.rx.try_recv() {
            (request.callback)(CommandStatus::NotConnected, &[]);
        }
    }
}

fn on_message(handle: u8, packet: &Packet<'_>) {
    if packet.is_command(CommandSet::General, GeneralCommand::PushAbnormalState as u8) {
        warn!(handle, payload = ?packet.payload(), "device pushed abnormal state");
    } else {
        trace!(handle, command_id = packet.command_id(), "ignoring message");
    }
}
