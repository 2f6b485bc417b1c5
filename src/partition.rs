//! Logical files ("partitions") and the `mish` block table
//!
//! Each `blkx` directory entry carries one `mish` record: the file's
//! top-level geometry followed by an array of 40-byte block descriptors.
//! Parsing is deliberately forgiving: per-record violations end the table
//! walk and leave the partition marked not-correct instead of failing the
//! whole container.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::ChecksumRecord;
use crate::error::{DmgError, Result};
use crate::format::{
    Block, MISH_SIGNATURE, METHOD_COMMENT, METHOD_END, SECTOR_NUMBER_LIMIT,
};

const MISH_HEAD_SIZE: usize = 0xCC;
const BLOCK_RECORD_SIZE: usize = 40;

/// One logical file within the image, typically a partition slice
#[derive(Debug, Clone)]
pub struct Partition {
    /// Name from the directory entry; may be empty
    pub name: String,
    /// True when the name was truncated at a non-ASCII byte by the
    /// resource-fork name policy
    pub name_is_approximate: bool,
    /// Decompressed size in bytes
    pub size: u64,
    /// Total compressed bytes across all blocks
    pub pack_size: u64,
    /// Start of this file's compressed data, relative to the data fork
    pub start_pack_pos: u64,
    /// Largest decompressed size among clustered blocks
    pub block_size_max: u64,
    /// First decompressed sector of this file within the whole image
    pub start_unpack_sector: u64,
    /// Declared decompressed sector count
    pub num_unpack_sectors: u64,
    /// Directory descriptor field, as stored
    pub descriptor: i32,
    /// The table walk completed and the declared sector count matches
    pub is_correct: bool,
    /// True iff no block is excluded from the file-level CRC
    pub full_file_checksum: bool,
    /// The file's checksum record (usually CRC-32 of the decompressed data)
    pub checksum: ChecksumRecord,
    /// Block descriptors, strictly ascending by `unp_pos` with no gaps
    pub blocks: Vec<Block>,
}

impl Partition {
    /// Parse a `mish` block table.
    ///
    /// Structural problems with the header itself (bad magic, version, or
    /// a record count that disagrees with the payload size) are hard
    /// errors. Violations inside individual records abort the walk softly,
    /// leaving `is_correct` false.
    pub fn parse(name: String, data: &[u8]) -> Result<Partition> {
        if data.len() < MISH_HEAD_SIZE {
            return Err(DmgError::InvalidStructure("block table too small".into()));
        }
        if BigEndian::read_u32(&data[0..]) != MISH_SIGNATURE {
            return Err(DmgError::InvalidStructure("invalid block table signature".into()));
        }
        if BigEndian::read_u32(&data[4..]) != 1 {
            return Err(DmgError::InvalidStructure("unsupported block table version".into()));
        }

        let mut partition = Partition {
            name,
            name_is_approximate: false,
            size: 0,
            pack_size: 0,
            start_pack_pos: BigEndian::read_u64(&data[0x18..]),
            block_size_max: 0,
            start_unpack_sector: BigEndian::read_u64(&data[0x08..]),
            num_unpack_sectors: BigEndian::read_u64(&data[0x10..]),
            descriptor: BigEndian::read_u32(&data[0x24..]) as i32,
            is_correct: false,
            full_file_checksum: true,
            checksum: ChecksumRecord::parse(&data[0x40..]),
            blocks: Vec::new(),
        };

        let num_records = BigEndian::read_u32(&data[0xC8..]) as u64;
        if num_records * BLOCK_RECORD_SIZE as u64 + MISH_HEAD_SIZE as u64 != data.len() as u64 {
            return Err(DmgError::InvalidStructure("block table size mismatch".into()));
        }

        let mut p = MISH_HEAD_SIZE;
        for _ in 0..num_records {
            let method = BigEndian::read_u32(&data[p..]);

            let sector_num = BigEndian::read_u64(&data[p + 0x08..]);
            if sector_num >= SECTOR_NUMBER_LIMIT {
                return Ok(partition);
            }
            let unp_pos = sector_num << 9;

            let unp_sectors = BigEndian::read_u64(&data[p + 0x10..]);
            if unp_sectors >= SECTOR_NUMBER_LIMIT {
                return Ok(partition);
            }
            let unp_size = unp_sectors << 9;

            let new_size = unp_pos + unp_size;
            if new_size >= 1u64 << 63 {
                return Ok(partition);
            }

            let pack_pos = BigEndian::read_u64(&data[p + 0x18..]);
            let pack_size = BigEndian::read_u64(&data[p + 0x20..]);

            // Blocks must be consecutive without gaps
            if unp_pos != partition.size {
                return Ok(partition);
            }

            if method == METHOD_COMMENT {
                p += BLOCK_RECORD_SIZE;
                continue;
            }
            if method == METHOD_END {
                break;
            }

            // Only blocks with non-empty decompressed data are kept
            if unp_size != 0 {
                const MAX_POS: u64 = 1 << 63;
                if pack_pos >= MAX_POS || pack_size >= MAX_POS - pack_pos {
                    return Ok(partition);
                }

                let block = Block { method, unp_pos, pack_pos, pack_size };

                if block.is_clustered() && partition.block_size_max < unp_size {
                    partition.block_size_max = unp_size;
                }
                partition.pack_size += pack_size;
                if !block.needs_crc() {
                    partition.full_file_checksum = false;
                }

                partition.blocks.push(block);
                partition.size = new_size;
            }

            p += BLOCK_RECORD_SIZE;
        }

        if (partition.size >> 9) == partition.num_unpack_sectors {
            partition.is_correct = true;
        }

        Ok(partition)
    }

    /// Decompressed size of one block, derived from the position delta to
    /// the next block (or the file size for the last one)
    pub fn block_unpacked_size(&self, index: usize) -> u64 {
        if index + 1 == self.blocks.len() {
            self.size - self.blocks[index].unp_pos
        } else {
            self.blocks[index + 1].unp_pos - self.blocks[index].unp_pos
        }
    }

    /// Filesystem family detected from the partition name
    pub fn partition_type(&self) -> PartitionType {
        PartitionType::from_partition_name(&self.name)
    }
}

/// Partition filesystem type detected from the partition name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// HFS+ (case-insensitive)
    Hfs,
    /// HFSX (case-sensitive HFS+)
    Hfsx,
    /// Apple APFS
    Apfs,
    /// Other or unknown partition type
    Other,
}

impl PartitionType {
    /// Classify a partition from its directory name (e.g. "Apple_HFSX")
    pub fn from_partition_name(name: &str) -> Self {
        if name.contains("Apple_HFSX") {
            PartitionType::Hfsx
        } else if name.contains("Apple_HFS") {
            PartitionType::Hfs
        } else if name.contains("Apple_APFS") {
            PartitionType::Apfs
        } else {
            PartitionType::Other
        }
    }

    /// Returns `true` if this partition can be parsed as HFS+
    pub fn is_hfs_compatible(&self) -> bool {
        matches!(self, PartitionType::Hfs | PartitionType::Hfsx)
    }
}

/// File extension for a known Apple filesystem partition name, empty when
/// the name is not a recognized filesystem
pub fn apple_fs_extension(name: &str) -> &'static str {
    const KNOWN: &[(&str, &str)] = &[
        ("Apple_HFSX", "hfsx"),
        ("Apple_HFS", "hfs"),
        ("Apple_UFS", "ufs"),
        ("Apple_APFS", "apfs"),
        ("Apple_ISO", "iso"),
    ];
    for (apple_name, ext) in KNOWN {
        if name.contains(apple_name) {
            return ext;
        }
    }
    ""
}
