//! # LidarLink Core
//!
//! Core protocol implementation for the LidarLink control plane, the
//! command/discovery protocol spoken by networked LiDAR sensors and hubs.
//!
//! This crate provides:
//! - CRC-16/MCRF4XX and CRC-32 engines
//! - Packet encoding and decoding (zero-copy parsing)
//! - Command set tables and typed command bodies
//! - The device data model (broadcast codes, types, states, status codes)
//! - Error types and handling
//!
//! ## Packet Layout
//!
//! ```text
//! ┌─────┬─────────┬────────┬──────┬─────┬───────┬─────────┬────────┬─────────┬───────┐
//! │ SOF │ version │ length │ type │ seq │ crc16 │ cmd_set │ cmd_id │ payload │ crc32 │
//! │  1  │    1    │   2    │  1   │  2  │   2   │    1    │   1    │   var   │   4   │
//! └─────┴─────────┴────────┴──────┴─────┴───────┴─────────┴────────┴─────────┴───────┘
//!  └──────────── preamble (crc16) ──────────────┘
//!  └──────────────────────────── packet body (crc32) ─────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod crc;
pub mod device;
pub mod error;
pub mod frame;

pub use command::{
    BroadcastBody, CommandSet, ConnectedLidarInfo, GeneralCommand, HandshakeAck,
    HandshakeRequest, HeartbeatResponse, HubCommand, HubQueryLidarInformationResponse,
};
pub use crc::{CRC16_PREAMBLE_SEED, CRC32_PACKET_SEED, crc16, crc32};
pub use device::{
    BroadcastCode, BroadcastInfo, DeviceEvent, DeviceInfo, DeviceStatus, DeviceType,
    ErrorCode, HubErrorCode, LidarErrorCode, LidarFeature, LidarState, TopologyMode,
};
pub use error::{Error, FrameError, PayloadError};
pub use frame::{Packet, PacketBuilder, PacketIter, PacketType, SequenceGenerator};

/// Start-of-frame marker carried in byte 0 of every packet
pub const START_OF_FRAME: u8 = 0xAA;

/// Protocol version written into outgoing packets
pub const PROTOCOL_VERSION: u8 = 1;

/// Preamble size in bytes (SOF through preamble CRC-16)
pub const PREAMBLE_SIZE: usize = 9;

/// Fixed packet header size in bytes (preamble plus command set and id)
pub const PACKET_HEADER_SIZE: usize = 11;

/// Trailing CRC-32 size in bytes
pub const PACKET_CRC_SIZE: usize = 4;

/// Smallest well-formed packet (header, empty payload, trailing CRC-32)
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + PACKET_CRC_SIZE;

/// Largest command packet accepted on the control plane
pub const MAX_PACKET_SIZE: usize = 1536;

/// Maximum number of devices tracked at once
pub const MAX_DEVICES: usize = 32;

/// Handle permanently reserved for the hub in hub topology
pub const HUB_HANDLE: u8 = 31;

/// Length of a broadcast code on the wire, including the NUL terminator
pub const BROADCAST_CODE_SIZE: usize = 16;

/// Well-known UDP port devices broadcast to
pub const DISCOVERY_PORT: u16 = 55000;
