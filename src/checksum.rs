//! Checksum records and CRC-32 helpers
//!
//! UDIF containers carry CRC-32 (type 2) checksums in three places:
//! - Data-fork checksum: CRC-32 of the raw compressed block region
//! - Master checksum: CRC-32 of the per-file checksum words concatenated
//! - Per-file (`mish`) checksum: CRC-32 of the decompressed file content

use byteorder::{BigEndian, ByteOrder};

/// Checksum type code for CRC-32
pub const CHECKSUM_TYPE_CRC32: u32 = 2;

/// Maximum checksum payload carried by a record
pub const CHECKSUM_SIZE_MAX: usize = 0x80;

/// CRC-32 (IEEE polynomial) of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// The 136-byte checksum descriptor: type, bit width, payload
#[derive(Debug, Clone)]
pub struct ChecksumRecord {
    pub kind: u32,
    pub num_bits: u32,
    pub data: [u8; CHECKSUM_SIZE_MAX],
}

impl Default for ChecksumRecord {
    fn default() -> Self {
        ChecksumRecord {
            kind: 0,
            num_bits: 0,
            data: [0u8; CHECKSUM_SIZE_MAX],
        }
    }
}

impl ChecksumRecord {
    /// Read a checksum record from 136 bytes at the start of `buf`
    pub fn parse(buf: &[u8]) -> Self {
        let mut data = [0u8; CHECKSUM_SIZE_MAX];
        data.copy_from_slice(&buf[8..8 + CHECKSUM_SIZE_MAX]);
        ChecksumRecord {
            kind: BigEndian::read_u32(&buf[0..4]),
            num_bits: BigEndian::read_u32(&buf[4..8]),
            data,
        }
    }

    /// A record is CRC-32 iff type 2 with a 32-bit value
    pub fn is_crc32(&self) -> bool {
        self.kind == CHECKSUM_TYPE_CRC32 && self.num_bits == 32
    }

    /// The stored CRC-32 word (big-endian, first four payload bytes)
    pub fn crc32(&self) -> u32 {
        BigEndian::read_u32(&self.data[0..4])
    }

    /// Display name of the checksum type; empty for absent records
    pub fn type_name(&self) -> String {
        if self.num_bits == 0 {
            return String::new();
        }
        if self.is_crc32() {
            return "CRC".to_string();
        }
        format!("Checksum{}-{}", self.kind, self.num_bits)
    }

    /// Hex rendering of the checksum value. Short values (up to 8 bytes)
    /// print uppercase, longer digests lowercase.
    pub fn format_value(&self) -> String {
        if self.num_bits == 0 {
            return String::new();
        }
        let mut num_bytes = ((self.num_bits as usize) + 7) >> 3;
        if num_bytes > CHECKSUM_SIZE_MAX {
            num_bytes = CHECKSUM_SIZE_MAX;
        }
        if num_bytes <= 8 {
            to_hex_upper(&self.data[..num_bytes])
        } else {
            to_hex_lower(&self.data[..num_bytes])
        }
    }

    /// `"<type>: <value>"`, or empty when the record is absent
    pub fn display(&self) -> String {
        if self.num_bits == 0 {
            return String::new();
        }
        format!("{}: {}", self.type_name(), self.format_value())
    }
}

/// Lowercase hex rendering of a byte slice
pub fn to_hex_lower(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Uppercase hex rendering of a byte slice
pub fn to_hex_upper(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(s, "{b:02X}");
    }
    s
}
