//! Device data model shared by discovery, the device manager and callers.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::BROADCAST_CODE_SIZE;
use crate::error::PayloadError;

/// Factory-assigned identifier of one physical device.
///
/// Stored as the fixed 16-byte NUL-padded field used on the wire. A code
/// holds at most 15 printable ASCII characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BroadcastCode([u8; BROADCAST_CODE_SIZE]);

impl BroadcastCode {
    /// Maximum number of visible characters
    pub const MAX_LEN: usize = BROADCAST_CODE_SIZE - 1;

    /// Parse a broadcast code from text
    pub fn parse(code: &str) -> Result<Self, PayloadError> {
        let bytes = code.as_bytes();
        if bytes.is_empty()
            || bytes.len() > Self::MAX_LEN
            || !bytes.iter().all(u8::is_ascii_graphic)
        {
            return Err(PayloadError::InvalidBroadcastCode);
        }
        let mut raw = [0u8; BROADCAST_CODE_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Decode the NUL-padded wire field.
    ///
    /// Everything after the first NUL is discarded. A field without a
    /// terminator is truncated to [`Self::MAX_LEN`] characters.
    pub fn from_wire(field: &[u8; BROADCAST_CODE_SIZE]) -> Result<Self, PayloadError> {
        let end = field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::MAX_LEN)
            .min(Self::MAX_LEN);
        let text = std::str::from_utf8(&field[..end])
            .map_err(|_| PayloadError::InvalidBroadcastCode)?;
        Self::parse(text)
    }

    /// Decode the wire field for display, replacing every byte that is not
    /// printable ASCII with `?`. The result may be empty.
    pub fn from_wire_lossy(field: &[u8; BROADCAST_CODE_SIZE]) -> Self {
        let end = field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::MAX_LEN)
            .min(Self::MAX_LEN);
        let mut raw = [0u8; BROADCAST_CODE_SIZE];
        for (dst, &b) in raw.iter_mut().zip(&field[..end]) {
            *dst = if b.is_ascii_graphic() { b } else { b'?' };
        }
        Self(raw)
    }

    /// The NUL-padded wire field
    pub fn to_wire(&self) -> [u8; BROADCAST_CODE_SIZE] {
        self.0
    }

    /// The code as text
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        // parse() admits ASCII only
        std::str::from_utf8(&self.0[..end]).unwrap_or_default()
    }

    /// True for the all-zero code
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl FromStr for BroadcastCode {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BroadcastCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for BroadcastCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BroadcastCode({:?})", self.as_str())
    }
}

impl Serialize for BroadcastCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BroadcastCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Device model reported in broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    /// Hub aggregating several sensors
    Hub,
    /// Mid-40 sensor
    Mid40,
    /// Tele-15 sensor
    Tele,
    /// Horizon sensor
    Horizon,
    /// Sensor model this crate does not name
    Other(u8),
}

impl DeviceType {
    /// True for the hub
    pub fn is_hub(&self) -> bool {
        matches!(self, DeviceType::Hub)
    }

    /// True for every sensor model
    pub fn is_lidar(&self) -> bool {
        !self.is_hub()
    }
}

impl From<u8> for DeviceType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Hub,
            1 => Self::Mid40,
            2 => Self::Tele,
            3 => Self::Horizon,
            other => Self::Other(other),
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(value: DeviceType) -> Self {
        match value {
            DeviceType::Hub => 0,
            DeviceType::Mid40 => 1,
            DeviceType::Tele => 2,
            DeviceType::Horizon => 3,
            DeviceType::Other(other) => other,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Hub => f.write_str("Hub"),
            DeviceType::Mid40 => f.write_str("Mid-40"),
            DeviceType::Tele => f.write_str("Tele-15"),
            DeviceType::Horizon => f.write_str("Horizon"),
            DeviceType::Other(code) => write!(f, "type {code}"),
        }
    }
}

/// Working state reported by heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum LidarState {
    /// Initializing; status carries a progress counter
    Init = 0,
    /// Measuring
    Normal = 1,
    /// Low-power mode
    PowerSaving = 2,
    /// Motor spinning, laser off
    Standby = 3,
    /// Fault; status carries the error code
    Error = 4,
    /// Not reported yet
    #[default]
    Unknown = 5,
}

impl From<u8> for LidarState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Normal,
            2 => Self::PowerSaving,
            3 => Self::Standby,
            4 => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Optional feature currently enabled on a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum LidarFeature {
    /// No feature
    #[default]
    None,
    /// Rain/fog suppression
    RainFog,
    /// Feature value this crate does not name
    Other(u8),
}

impl From<u8> for LidarFeature {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::RainFog,
            other => Self::Other(other),
        }
    }
}

impl From<LidarFeature> for u8 {
    fn from(value: LidarFeature) -> Self {
        match value {
            LidarFeature::None => 0,
            LidarFeature::RainFog => 1,
            LidarFeature::Other(other) => other,
        }
    }
}

fn bits(value: u32, offset: u32, width: u32) -> u8 {
    ((value >> offset) & ((1 << width) - 1)) as u8
}

/// Packed 32-bit status word reported outside the init state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Interpret the word as reported by a sensor
    pub fn lidar(self) -> LidarErrorCode {
        LidarErrorCode(self.0)
    }

    /// Interpret the word as reported by a hub
    pub fn hub(self) -> HubErrorCode {
        HubErrorCode(self.0)
    }

    /// Overall system status: 0 normal, 1 warning, 2 error
    pub fn system_status(self) -> u8 {
        bits(self.0, 30, 2)
    }
}

/// Sensor view of an [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LidarErrorCode(u32);

impl LidarErrorCode {
    /// Temperature: 0 normal, 1 high or low, 2 extremely high or low
    pub fn temp_status(self) -> u8 {
        bits(self.0, 0, 2)
    }

    /// Supply voltage: 0 normal, 1 high, 2 extremely high
    pub fn volt_status(self) -> u8 {
        bits(self.0, 2, 2)
    }

    /// Motor: 0 normal, 1 warning, 2 error
    pub fn motor_status(self) -> u8 {
        bits(self.0, 4, 2)
    }

    /// Window: 0 clean, 1 dirty or blocked
    pub fn dirty_warn(self) -> u8 {
        bits(self.0, 6, 2)
    }

    /// Firmware: 0 ok, 1 abnormal, upgrade required
    pub fn firmware_err(self) -> u8 {
        bits(self.0, 8, 1)
    }

    /// PPS signal: 0 none, 1 ok
    pub fn pps_status(self) -> u8 {
        bits(self.0, 9, 1)
    }

    /// Device lifetime: 0 ok, 1 end of service life
    pub fn device_status(self) -> u8 {
        bits(self.0, 10, 1)
    }

    /// Fan: 0 ok, 1 warning
    pub fn fan_status(self) -> u8 {
        bits(self.0, 11, 1)
    }

    /// Low-temperature self heating: 0 off, 1 on
    pub fn self_heating(self) -> u8 {
        bits(self.0, 12, 1)
    }

    /// PTP time sync signal: 0 none, 1 ok
    pub fn ptp_status(self) -> u8 {
        bits(self.0, 13, 1)
    }

    /// Time synchronisation source: 0 none, 1 PTP, 2 GPS, 3 PPS, 4 abnormal
    pub fn time_sync_status(self) -> u8 {
        bits(self.0, 14, 3)
    }

    /// Overall system status: 0 normal, 1 warning, 2 error
    pub fn system_status(self) -> u8 {
        bits(self.0, 30, 2)
    }
}

/// Hub view of an [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubErrorCode(u32);

impl HubErrorCode {
    /// Time sync: 0 none, 1 PTP, 2 GPS, 3 PPS
    pub fn sync_status(self) -> u8 {
        bits(self.0, 0, 2)
    }

    /// Temperature: 0 normal, 1 high or low, 2 extremely high or low
    pub fn temp_status(self) -> u8 {
        bits(self.0, 2, 2)
    }

    /// Any attached sensor in error: 0 no, 1 yes
    pub fn lidar_status(self) -> u8 {
        bits(self.0, 4, 1)
    }

    /// Sensor link changed: 0 no, 1 yes
    pub fn lidar_link_status(self) -> u8 {
        bits(self.0, 5, 1)
    }

    /// Firmware: 0 ok, 1 abnormal, upgrade required
    pub fn firmware_err(self) -> u8 {
        bits(self.0, 6, 1)
    }

    /// Overall system status: 0 normal, 1 warning, 2 error
    pub fn system_status(self) -> u8 {
        bits(self.0, 30, 2)
    }
}

/// Status field of a device record.
///
/// Which variant is valid depends on the working state: a device in
/// [`LidarState::Init`] reports initialisation progress, every other state
/// reports a packed status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    /// Initialisation progress (0..=100)
    Progress(u32),
    /// Packed status word
    Code(ErrorCode),
}

impl DeviceStatus {
    /// Interpret a raw status word for `state`
    pub fn from_raw(state: LidarState, raw: u32) -> Self {
        match state {
            LidarState::Init => DeviceStatus::Progress(raw),
            _ => DeviceStatus::Code(ErrorCode(raw)),
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Progress(0)
    }
}

/// A device broadcast, as handed to broadcast observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastInfo {
    /// Identifier of the announcing device
    pub broadcast_code: BroadcastCode,
    /// Announced model
    pub device_type: DeviceType,
    /// Source address of the broadcast
    pub ip: Ipv4Addr,
}

/// Everything known about one device handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Identifier of the physical device
    pub broadcast_code: BroadcastCode,
    /// Table handle (0..=31)
    pub handle: u8,
    /// Hub slot the sensor is plugged into (hub topology only)
    pub slot: u8,
    /// Position within the hub slot (hub topology only)
    pub id: u8,
    /// Model
    pub device_type: DeviceType,
    /// Device address
    pub ip: Ipv4Addr,
    /// Local port negotiated for commands
    pub cmd_port: u16,
    /// Local port negotiated for point data
    pub data_port: u16,
    /// Local port negotiated for IMU/sensor data
    pub sensor_port: u16,
    /// Last reported working state
    pub state: LidarState,
    /// Last reported feature
    pub feature: LidarFeature,
    /// Last reported status, discriminated by `state`
    pub status: DeviceStatus,
}

impl DeviceInfo {
    /// A record for a freshly announced device; ports and state are filled in later
    pub fn new(broadcast_code: BroadcastCode, handle: u8, device_type: DeviceType) -> Self {
        Self {
            broadcast_code,
            handle,
            slot: 0,
            id: 0,
            device_type,
            ip: Ipv4Addr::UNSPECIFIED,
            cmd_port: 0,
            data_port: 0,
            sensor_port: 0,
            state: LidarState::Unknown,
            feature: LidarFeature::None,
            status: DeviceStatus::Progress(0),
        }
    }
}

/// Device lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceEvent {
    /// Device admitted after a successful handshake
    Connect,
    /// Device lost
    Disconnect,
    /// Working state, feature or status changed
    StateChange,
    /// Hub connected or its sensor membership changed
    HubConnectionChange,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceEvent::Connect => "connect",
            DeviceEvent::Disconnect => "disconnect",
            DeviceEvent::StateChange => "state-change",
            DeviceEvent::HubConnectionChange => "hub-connection-change",
        };
        f.write_str(name)
    }
}

/// How devices are attached, latched on first admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TopologyMode {
    /// Nothing admitted yet
    #[default]
    None,
    /// Sensors reached through a hub
    Hub,
    /// Sensors connected directly
    Lidar,
}
