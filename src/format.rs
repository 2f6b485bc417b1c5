//! Binary format definitions for UDIF containers
//!
//! A UDIF image is a self-describing container:
//! 1. Data fork (compressed block payloads)
//! 2. Directory: an XML plist or a classic resource fork, both carrying
//!    one `mish` block table per logical file
//! 3. Koly trailer (512 bytes, normally at the end of the container,
//!    at offset 0 for "front koly" images)

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::ChecksumRecord;
use crate::error::{DmgError, Result};

/// Koly trailer size in bytes
pub const KOLY_SIZE: usize = 0x200;

/// The koly detection oracle: magic, version 4, header size 0x200
pub const KOLY_SIGNATURE: [u8; 12] = [b'k', b'o', b'l', b'y', 0, 0, 0, 4, 0, 0, 2, 0];

/// Mish block-table magic "mish" (0x6D697368)
pub const MISH_SIGNATURE: u32 = 0x6D69_7368;

/// 512-byte sectors everywhere in the container
pub const SECTOR_SIZE: u64 = 512;

/// Sector numbers at or above this limit cannot be expressed as byte
/// positions in 63 bits
pub const SECTOR_NUMBER_LIMIT: u64 = 1 << (63 - 9);

// Block method codes. All multi-byte integers in the container are
// big-endian; methods with the high bit set carry compressed payloads.
pub const METHOD_ZERO_FILL: u32 = 0x0000_0000;
pub const METHOD_COPY: u32 = 0x0000_0001;
pub const METHOD_ZERO_NOCRC: u32 = 0x0000_0002;
pub const METHOD_ADC: u32 = 0x8000_0004;
pub const METHOD_ZLIB: u32 = 0x8000_0005;
pub const METHOD_BZIP2: u32 = 0x8000_0006;
pub const METHOD_LZFSE: u32 = 0x8000_0007;
pub const METHOD_XZ: u32 = 0x8000_0008;
pub const METHOD_COMMENT: u32 = 0x7FFF_FFFE;
pub const METHOD_END: u32 = 0xFFFF_FFFF;

/// Check whether a buffer starts with the koly signature
pub fn is_koly(buf: &[u8]) -> bool {
    buf.len() >= KOLY_SIGNATURE.len() && buf[..KOLY_SIGNATURE.len()] == KOLY_SIGNATURE
}

/// Block method, decoded from the raw 32-bit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Zero-filled run, included in the file-level CRC
    ZeroFill,
    /// Raw bytes, stored uncompressed
    Copy,
    /// Zero-filled run excluded from the file-level CRC
    ZeroNoCrc,
    /// Apple Data Compression (LZ variant)
    Adc,
    /// Zlib (RFC 1950)
    Zlib,
    /// Bzip2
    Bzip2,
    /// LZFSE; recognized but not decodable
    Lzfse,
    /// XZ
    Xz,
    /// Non-data marker, skipped during parsing
    Comment,
    /// Terminates the block list
    End,
}

impl TryFrom<u32> for BlockType {
    type Error = DmgError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            METHOD_ZERO_FILL => Ok(BlockType::ZeroFill),
            METHOD_COPY => Ok(BlockType::Copy),
            METHOD_ZERO_NOCRC => Ok(BlockType::ZeroNoCrc),
            METHOD_ADC => Ok(BlockType::Adc),
            METHOD_ZLIB => Ok(BlockType::Zlib),
            METHOD_BZIP2 => Ok(BlockType::Bzip2),
            METHOD_LZFSE => Ok(BlockType::Lzfse),
            METHOD_XZ => Ok(BlockType::Xz),
            METHOD_COMMENT => Ok(BlockType::Comment),
            METHOD_END => Ok(BlockType::End),
            _ => Err(DmgError::UnsupportedMethod(value)),
        }
    }
}

impl BlockType {
    /// Short display name, used by the compression census
    pub fn name(&self) -> &'static str {
        match self {
            BlockType::ZeroFill => "Zero0",
            BlockType::Copy => "Copy",
            BlockType::ZeroNoCrc => "Zero2",
            BlockType::Adc => "ADC",
            BlockType::Zlib => "ZLIB",
            BlockType::Bzip2 => "BZip2",
            BlockType::Lzfse => "LZFSE",
            BlockType::Xz => "XZ",
            BlockType::Comment => "Comment",
            BlockType::End => "End",
        }
    }
}

/// A (offset, length) pair addressing one fork of the container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkPair {
    pub offset: u64,
    pub len: u64,
}

impl ForkPair {
    /// Read a fork pair from 16 bytes at the start of `buf`
    pub fn parse(buf: &[u8]) -> Self {
        ForkPair {
            offset: BigEndian::read_u64(&buf[0..8]),
            len: BigEndian::read_u64(&buf[8..16]),
        }
    }

    /// End position of the fork, `None` on 64-bit overflow
    pub fn end_pos(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }

    /// Validate the pair against `limit` and raise `top` to the fork's end
    /// position if it reaches further. Returns `false` when the pair does
    /// not fit below `limit`.
    pub fn update_top(&self, limit: u64, top: &mut u64) -> bool {
        if self.offset > limit || self.len > limit - self.offset {
            return false;
        }
        let end_pos = self.offset + self.len;
        if *top <= end_pos {
            *top = end_pos;
        }
        true
    }

    /// True when either field is nonzero
    pub fn is_set(&self) -> bool {
        self.offset != 0 || self.len != 0
    }
}

/// One block descriptor from a `mish` table.
///
/// The decompressed size is not stored; it is derived from the
/// virtual-position delta to the next block (see
/// [`Partition::block_unpacked_size`](crate::Partition::block_unpacked_size)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Raw method code; unknown codes survive parsing and fail only when
    /// a read reaches the block
    pub method: u32,
    /// Decompressed (virtual) byte position within the file
    pub unp_pos: u64,
    /// Compressed byte position, relative to the file's pack start
    pub pack_pos: u64,
    /// Compressed size in bytes
    pub pack_size: u64,
}

impl Block {
    /// Methods 0 and 2 both decompress to runs of zero bytes
    pub fn is_zero_method(&self) -> bool {
        self.method & !METHOD_ZERO_NOCRC == 0
    }

    /// Method 2 blocks are excluded from the file-level CRC
    pub fn needs_crc(&self) -> bool {
        self.method != METHOD_ZERO_NOCRC
    }

    /// Everything except zero runs counts toward the cluster size.
    /// Copy blocks are not excluded; most images store them unfused.
    pub fn is_clustered(&self) -> bool {
        !self.is_zero_method()
    }

    /// Zero runs are synthesized and copy blocks are read straight from
    /// the source; only compressed blocks need a decode buffer.
    pub fn needs_buffer(&self) -> bool {
        !self.is_zero_method() && self.method != METHOD_COPY
    }

    /// Typed view of the method code
    pub fn block_type(&self) -> Result<BlockType> {
        BlockType::try_from(self.method)
    }
}

/// The parsed koly trailer.
///
/// Only the fields the reader consumes are kept; the canonical offsets
/// within the 512-byte record are fixed by the format (v4).
#[derive(Debug, Clone)]
pub struct KolyTrailer {
    pub data_fork: ForkPair,
    pub rsrc_fork: ForkPair,
    pub xml_fork: ForkPair,
    pub blob_fork: ForkPair,
    pub segment_id: [u8; 16],
    pub data_fork_checksum: ChecksumRecord,
    pub master_checksum: ChecksumRecord,
    /// Total decompressed sector count; stored unaligned at 0x1EC
    pub sector_count: u64,
}

impl KolyTrailer {
    /// Parse a 512-byte trailer buffer
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < KOLY_SIZE || !is_koly(buf) {
            return Err(DmgError::NotUdif);
        }

        let mut segment_id = [0u8; 16];
        segment_id.copy_from_slice(&buf[0x40..0x50]);

        Ok(KolyTrailer {
            data_fork: ForkPair::parse(&buf[0x18..]),
            rsrc_fork: ForkPair::parse(&buf[0x28..]),
            xml_fork: ForkPair::parse(&buf[0xD8..]),
            blob_fork: ForkPair::parse(&buf[0x128..]),
            segment_id,
            data_fork_checksum: ChecksumRecord::parse(&buf[0x50..]),
            master_checksum: ChecksumRecord::parse(&buf[0x160..]),
            sector_count: BigEndian::read_u64(&buf[0x1EC..]),
        })
    }
}
