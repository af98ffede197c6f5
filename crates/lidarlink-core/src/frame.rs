//! Packet encoding and decoding for the LidarLink wire protocol.
//!
//! This module implements zero-copy parsing of control-plane packets. All
//! multi-byte fields are little-endian. Validation happens in wire order so
//! that a corrupt preamble is rejected before the rest of the packet is
//! trusted:
//!
//! 1. start-of-frame marker
//! 2. preamble CRC-16 residual over bytes `[0, 9)`
//! 3. announced length against the buffer
//! 4. trailing CRC-32 over bytes `[0, length - 4)`
//!
//! The codec treats payloads as opaque bytes; typed bodies live in
//! [`crate::command`].

use std::sync::atomic::{AtomicU16, Ordering};

use crate::command::CommandSet;
use crate::crc::{CRC16_PREAMBLE_SEED, CRC32_PACKET_SEED, crc16, crc32};
use crate::error::FrameError;
use crate::{
    MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_CRC_SIZE, PACKET_HEADER_SIZE, PREAMBLE_SIZE,
    PROTOCOL_VERSION, START_OF_FRAME,
};

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Request that expects a reply
    Cmd = 0x00,
    /// Reply to a request
    Ack = 0x01,
    /// Unsolicited message, no reply
    Msg = 0x02,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Cmd),
            0x01 => Ok(Self::Ack),
            0x02 => Ok(Self::Msg),
            _ => Err(FrameError::InvalidPacketType(value)),
        }
    }
}

/// Zero-copy packet view into a receive buffer
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    raw: &'a [u8],
    version: u8,
    packet_type: PacketType,
    sequence: u16,
    command_set: CommandSet,
    command_id: u8,
}

impl<'a> Packet<'a> {
    /// Decode the first packet in `data` (zero-copy).
    ///
    /// Trailing bytes past the announced length are ignored; use
    /// [`Packet::len`] or [`PacketIter`] to walk a datagram carrying
    /// several packets.
    pub fn decode(data: &'a [u8]) -> Result<Self, FrameError> {
        let Some(&sof) = data.first() else {
            return Err(FrameError::TooShort {
                expected: MIN_PACKET_SIZE,
                actual: 0,
            });
        };
        if sof != START_OF_FRAME {
            return Err(FrameError::UnexpectedFrame(sof));
        }
        if data.len() < PREAMBLE_SIZE {
            return Err(FrameError::TooShort {
                expected: PREAMBLE_SIZE,
                actual: data.len(),
            });
        }

        let residual = crc16(CRC16_PREAMBLE_SEED, &data[..PREAMBLE_SIZE]);
        if residual != 0 {
            return Err(FrameError::MalformedPreamble(residual));
        }

        let length = u16::from_le_bytes([data[2], data[3]]);
        let total = usize::from(length);
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&total) {
            return Err(FrameError::InvalidLength(length));
        }
        if data.len() < total {
            return Err(FrameError::TooShort {
                expected: total,
                actual: data.len(),
            });
        }

        let body_end = total - PACKET_CRC_SIZE;
        let expected = crc32(CRC32_PACKET_SEED, &data[..body_end]);
        let found = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        if expected != found {
            return Err(FrameError::MalformedPacket { expected, found });
        }

        Ok(Self {
            raw: &data[..total],
            version: data[1],
            packet_type: PacketType::try_from(data[4])?,
            sequence: u16::from_le_bytes([data[5], data[6]]),
            command_set: CommandSet::try_from(data[9])?,
            command_id: data[10],
        })
    }

    /// Get the protocol version byte
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Get the packet type
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Get the sequence number
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Get the command set
    pub fn command_set(&self) -> CommandSet {
        self.command_set
    }

    /// Get the command id (meaning depends on the command set)
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    /// True if this packet carries `(set, id)`
    pub fn is_command(&self, set: CommandSet, id: u8) -> bool {
        self.command_set == set && self.command_id == id
    }

    /// Total encoded length, as announced in the header
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false for a decoded packet; present for API symmetry
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Get the payload slice (zero-copy)
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[PACKET_HEADER_SIZE..self.raw.len() - PACKET_CRC_SIZE]
    }

    /// Get the encoded packet bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

/// Iterator over the packets packed back-to-back in one datagram.
///
/// Yields each decoded packet in order. The first decode error is yielded
/// once and ends the iteration, since the remaining bytes cannot be framed.
#[derive(Debug)]
pub struct PacketIter<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> PacketIter<'a> {
    /// Iterate the packets in `datagram`
    pub fn new(datagram: &'a [u8]) -> Self {
        Self {
            remaining: datagram,
            failed: false,
        }
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<Packet<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        match Packet::decode(self.remaining) {
            Ok(packet) => {
                self.remaining = &self.remaining[packet.len()..];
                Some(Ok(packet))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Builder for constructing packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    packet_type: PacketType,
    sequence: u16,
    command_set: CommandSet,
    command_id: u8,
    payload: Vec<u8>,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self {
            packet_type: PacketType::Cmd,
            sequence: 0,
            command_set: CommandSet::General,
            command_id: 0,
            payload: Vec::new(),
        }
    }
}

impl PacketBuilder {
    /// Create a new packet builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the packet type
    pub fn packet_type(mut self, packet_type: PacketType) -> Self {
        self.packet_type = packet_type;
        self
    }

    /// Set the sequence number
    pub fn sequence(mut self, seq: u16) -> Self {
        self.sequence = seq;
        self
    }

    /// Set the command set and id
    pub fn command(mut self, set: CommandSet, id: u8) -> Self {
        self.command_set = set;
        self.command_id = id;
        self
    }

    /// Set the payload
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Build the packet into a byte buffer
    pub fn build(self) -> Result<Vec<u8>, FrameError> {
        let total = MIN_PACKET_SIZE + self.payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let length = u16::try_from(total).map_err(|_| FrameError::PayloadTooLarge(total))?;

        let mut buf = Vec::with_capacity(total);

        // Preamble
        buf.push(START_OF_FRAME);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        let preamble_crc = crc16(CRC16_PREAMBLE_SEED, &buf);
        buf.extend_from_slice(&preamble_crc.to_le_bytes());

        // Command header and payload
        buf.push(self.command_set as u8);
        buf.push(self.command_id);
        buf.extend_from_slice(&self.payload);

        let packet_crc = crc32(CRC32_PACKET_SEED, &buf);
        buf.extend_from_slice(&packet_crc.to_le_bytes());

        Ok(buf)
    }
}

/// Wrapping sequence number source shared by everything that sends packets
#[derive(Debug, Default)]
pub struct SequenceGenerator(AtomicU16);

impl SequenceGenerator {
    /// Create a generator starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a generator starting at `start`
    pub fn starting_at(start: u16) -> Self {
        Self(AtomicU16::new(start))
    }

    /// Take the next sequence number
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
