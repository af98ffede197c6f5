//! Table-driven CRC engines used by the wire codec.
//!
//! Two checksums protect every packet:
//!
//! - CRC-16/MCRF4XX (reflected polynomial `0x8408`, no final XOR) over the
//!   7-byte preamble, seeded with [`CRC16_PREAMBLE_SEED`]. Because the CRC is
//!   stored little-endian right after the bytes it covers, running the same CRC
//!   over all 9 preamble bytes yields a residual of zero for an intact preamble.
//! - CRC-32 (reflected polynomial `0xEDB88320`, final XOR `0xFFFFFFFF`) over the
//!   whole packet minus its trailing 4 bytes, seeded with [`CRC32_PACKET_SEED`].
//!
//! Both functions are pure; the lookup tables are built at compile time.

/// Seed for the preamble CRC-16
pub const CRC16_PREAMBLE_SEED: u16 = 0x4c49;

/// Seed for the whole-packet CRC-32
pub const CRC32_PACKET_SEED: u32 = 0x564f_580a;

const CRC16_POLY: u16 = 0x8408;
const CRC32_POLY: u32 = 0xEDB8_8320;

static CRC16_TABLE: [u16; 256] = build_crc16_table();
static CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC16_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute CRC-16/MCRF4XX over `data`, starting from `seed`.
///
/// # Examples
///
/// ```
/// use lidarlink_core::crc16;
///
/// assert_eq!(crc16(0xFFFF, b"123456789"), 0x6F91);
/// ```
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &byte| {
        (crc >> 8) ^ CRC16_TABLE[usize::from((crc as u8) ^ byte)]
    })
}

/// Compute CRC-32 over `data`, starting from `seed`.
///
/// The seed is inverted on entry and the result inverted on exit, so a
/// seed of zero gives the standard CRC-32 (IEEE 802.3) value.
///
/// # Examples
///
/// ```
/// use lidarlink_core::crc32;
///
/// assert_eq!(crc32(0, b"123456789"), 0xCBF4_3926);
/// ```
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let crc = data.iter().fold(seed ^ 0xFFFF_FFFF, |crc, &byte| {
        (crc >> 8) ^ CRC32_TABLE[usize::from((crc as u8) ^ byte)]
    });
    crc ^ 0xFFFF_FFFF
}
