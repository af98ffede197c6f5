//! Command sets, command ids and the typed bodies used by the connection layer.
//!
//! Bodies are fixed little-endian layouts with no padding. Decoders accept
//! trailing bytes so that newer firmware can append fields.

use std::net::Ipv4Addr;

use crate::BROADCAST_CODE_SIZE;
use crate::device::{BroadcastCode, DeviceStatus, DeviceType, LidarFeature, LidarState};
use crate::error::{FrameError, PayloadError};

/// Command set carried in byte 9 of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandSet {
    /// Commands common to every device
    General = 0x00,
    /// Sensor-specific commands
    Lidar = 0x01,
    /// Hub-specific commands
    Hub = 0x02,
}

impl TryFrom<u8> for CommandSet {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::General),
            0x01 => Ok(Self::Lidar),
            0x02 => Ok(Self::Hub),
            _ => Err(FrameError::InvalidCommandSet(value)),
        }
    }
}

/// Command ids in [`CommandSet::General`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GeneralCommand {
    /// Periodic device announcement
    Broadcast = 0x00,
    /// Establish the command channel
    Handshake = 0x01,
    /// Query firmware version
    DeviceInfo = 0x02,
    /// Keepalive carrying working state
    Heartbeat = 0x03,
    /// Start or stop sampling
    ControlSample = 0x04,
    /// Select cartesian or spherical output
    CoordinateSystem = 0x05,
    /// Tear down the command channel
    Disconnect = 0x06,
    /// Unsolicited abnormal status push
    PushAbnormalState = 0x07,
    /// Configure static or dynamic IP
    ConfigureIp = 0x08,
    /// Read IP configuration
    GetDeviceIp = 0x09,
    /// Reboot
    RebootDevice = 0x0A,
}

impl TryFrom<u8> for GeneralCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Broadcast),
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::DeviceInfo),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::ControlSample),
            0x05 => Ok(Self::CoordinateSystem),
            0x06 => Ok(Self::Disconnect),
            0x07 => Ok(Self::PushAbnormalState),
            0x08 => Ok(Self::ConfigureIp),
            0x09 => Ok(Self::GetDeviceIp),
            0x0A => Ok(Self::RebootDevice),
            other => Err(other),
        }
    }
}

/// Command ids in [`CommandSet::Hub`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HubCommand {
    /// List the sensors attached to the hub
    QueryLidarInformation = 0x00,
}

fn ensure_len(body: &'static str, data: &[u8], expected: usize) -> Result<(), PayloadError> {
    if data.len() < expected {
        return Err(PayloadError::Truncated {
            body,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn code_field(data: &[u8]) -> [u8; BROADCAST_CODE_SIZE] {
    let mut field = [0u8; BROADCAST_CODE_SIZE];
    field.copy_from_slice(&data[..BROADCAST_CODE_SIZE]);
    field
}

/// Body of a [`GeneralCommand::Broadcast`] message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastBody {
    /// Announcing device
    pub broadcast_code: BroadcastCode,
    /// Announced model
    pub device_type: DeviceType,
}

impl BroadcastBody {
    /// Encoded size: code, type, two reserved bytes
    pub const SIZE: usize = BROADCAST_CODE_SIZE + 3;

    /// Decode from a packet payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("broadcast", data, Self::SIZE)?;
        Ok(Self {
            broadcast_code: BroadcastCode::from_wire(&code_field(data))?,
            device_type: DeviceType::from(data[BROADCAST_CODE_SIZE]),
        })
    }

    /// Decode without validating the code; unprintable bytes become `?`.
    ///
    /// Fails only on truncation.
    pub fn decode_lossy(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("broadcast", data, Self::SIZE)?;
        Ok(Self {
            broadcast_code: BroadcastCode::from_wire_lossy(&code_field(data)),
            device_type: DeviceType::from(data[BROADCAST_CODE_SIZE]),
        })
    }

    /// Encode into a packet payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.broadcast_code.to_wire());
        buf.push(self.device_type.into());
        buf.extend_from_slice(&[0u8; 2]); // Reserved
        buf
    }
}

/// Body of a [`GeneralCommand::Handshake`] request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Host address the device should send to
    pub ip: Ipv4Addr,
    /// Host port for point data
    pub data_port: u16,
    /// Host port for commands
    pub cmd_port: u16,
    /// Host port for IMU/sensor data
    pub sensor_port: u16,
}

impl HandshakeRequest {
    /// Encoded size
    pub const SIZE: usize = 10;

    /// Decode from a packet payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("handshake request", data, Self::SIZE)?;
        Ok(Self {
            ip: Ipv4Addr::new(data[0], data[1], data[2], data[3]),
            data_port: u16::from_le_bytes([data[4], data[5]]),
            cmd_port: u16::from_le_bytes([data[6], data[7]]),
            sensor_port: u16::from_le_bytes([data[8], data[9]]),
        })
    }

    /// Encode into a packet payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.ip.octets());
        buf.extend_from_slice(&self.data_port.to_le_bytes());
        buf.extend_from_slice(&self.cmd_port.to_le_bytes());
        buf.extend_from_slice(&self.sensor_port.to_le_bytes());
        buf
    }
}

/// Body of a [`GeneralCommand::Handshake`] acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeAck {
    /// 0 on success
    pub ret_code: u8,
}

impl HandshakeAck {
    /// Decode from a packet payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("handshake ack", data, 1)?;
        Ok(Self { ret_code: data[0] })
    }

    /// True if the device accepted the handshake
    pub fn is_success(&self) -> bool {
        self.ret_code == 0
    }
}

/// Body of a [`GeneralCommand::Heartbeat`] acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// 0 on success
    pub ret_code: u8,
    /// Working state
    pub state: LidarState,
    /// Enabled feature
    pub feature: LidarFeature,
    /// Progress or packed status word, depending on `state`
    pub status: DeviceStatus,
}

impl HeartbeatResponse {
    /// Encoded size
    pub const SIZE: usize = 7;

    /// Decode from a packet payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("heartbeat", data, Self::SIZE)?;
        let state = LidarState::from(data[1]);
        let raw = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
        Ok(Self {
            ret_code: data[0],
            state,
            feature: LidarFeature::from(data[2]),
            status: DeviceStatus::from_raw(state, raw),
        })
    }

    /// Encode into a packet payload
    pub fn encode(&self) -> Vec<u8> {
        let raw = match self.status {
            DeviceStatus::Progress(progress) => progress,
            DeviceStatus::Code(code) => code.0,
        };
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.ret_code);
        buf.push(self.state as u8);
        buf.push(self.feature.into());
        buf.extend_from_slice(&raw.to_le_bytes());
        buf
    }
}

/// One sensor attached to a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedLidarInfo {
    /// Sensor identifier
    pub broadcast_code: BroadcastCode,
    /// Sensor model
    pub device_type: DeviceType,
    /// Firmware version
    pub version: [u8; 4],
    /// Hub slot (1-based)
    pub slot: u8,
    /// Position within the slot (1-based)
    pub id: u8,
}

impl ConnectedLidarInfo {
    /// Encoded size
    pub const SIZE: usize = BROADCAST_CODE_SIZE + 7;

    /// Decode one entry
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("connected lidar", data, Self::SIZE)?;
        let rest = &data[BROADCAST_CODE_SIZE..];
        Ok(Self {
            broadcast_code: BroadcastCode::from_wire(&code_field(data))?,
            device_type: DeviceType::from(rest[0]),
            version: [rest[1], rest[2], rest[3], rest[4]],
            slot: rest[5],
            id: rest[6],
        })
    }

    /// Encode one entry
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.broadcast_code.to_wire());
        buf.push(self.device_type.into());
        buf.extend_from_slice(&self.version);
        buf.push(self.slot);
        buf.push(self.id);
    }

    /// Device handle for this sensor: `(slot - 1) * 3 + (id - 1)`.
    ///
    /// `None` when slot or id is zero.
    pub fn handle(&self) -> Option<u8> {
        let slot = self.slot.checked_sub(1)?;
        let id = self.id.checked_sub(1)?;
        slot.checked_mul(3)?.checked_add(id)
    }
}

/// Body of a [`HubCommand::QueryLidarInformation`] acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubQueryLidarInformationResponse {
    /// 0 on success
    pub ret_code: u8,
    /// Attached sensors
    pub lidars: Vec<ConnectedLidarInfo>,
}

impl HubQueryLidarInformationResponse {
    /// Decode from a packet payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        ensure_len("hub lidar information", data, 2)?;
        let count = usize::from(data[1]);
        let entries = &data[2..];
        ensure_len(
            "hub lidar information",
            entries,
            count * ConnectedLidarInfo::SIZE,
        )?;

        let lidars = entries
            .chunks_exact(ConnectedLidarInfo::SIZE)
            .take(count)
            .map(ConnectedLidarInfo::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ret_code: data[0],
            lidars,
        })
    }

    /// Encode into a packet payload.
    ///
    /// The count field is one byte; entries past the 255th are not encoded.
    pub fn encode(&self) -> Vec<u8> {
        let count = u8::try_from(self.lidars.len()).unwrap_or(u8::MAX);
        let mut buf = Vec::with_capacity(2 + usize::from(count) * ConnectedLidarInfo::SIZE);
        buf.push(self.ret_code);
        buf.push(count);
        for lidar in self.lidars.iter().take(usize::from(count)) {
            lidar.encode_into(&mut buf);
        }
        buf
    }

    /// True if the hub answered successfully
    pub fn is_success(&self) -> bool {
        self.ret_code == 0
    }
}
