//! Error types for the LidarLink core protocol.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Command body error
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Packet-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer too short to hold the packet
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Start-of-frame marker was not `0xAA`
    #[error("unexpected start of frame: 0x{0:02X}")]
    UnexpectedFrame(u8),

    /// Preamble CRC-16 residual was nonzero
    #[error("malformed preamble: crc16 residual 0x{0:04X}")]
    MalformedPreamble(u16),

    /// Trailing CRC-32 did not match the packet contents
    #[error("malformed packet: crc32 expected 0x{expected:08X}, found 0x{found:08X}")]
    MalformedPacket {
        /// CRC computed over the received bytes
        expected: u32,
        /// CRC carried in the trailing field
        found: u32,
    },

    /// Announced length is smaller than a bare header or above the limit
    #[error("invalid packet length: {0}")]
    InvalidLength(u16),

    /// Unknown packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown command set byte
    #[error("invalid command set: 0x{0:02X}")]
    InvalidCommandSet(u8),

    /// Payload does not fit in a single packet
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl FrameError {
    /// True for the two checksum failures
    pub fn is_crc_failure(&self) -> bool {
        matches!(
            self,
            FrameError::MalformedPreamble(_) | FrameError::MalformedPacket { .. }
        )
    }
}

/// Command body decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// Body shorter than its fixed layout
    #[error("{body} body truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Name of the body being decoded
        body: &'static str,
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Broadcast code empty, too long, or not printable ASCII
    #[error("invalid broadcast code")]
    InvalidBroadcastCode,
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
