//! Resource-fork directory parser
//!
//! Older images carry no XML plist; the directory is a classic Macintosh
//! resource fork instead. Only the `blkx` resource type is consumed, each
//! entry holding a length-prefixed `mish` table in the main-data region
//! and optionally a Pascal-style name in the footer's name list.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DmgError, Result};

const RSRC_HEAD_SIZE: u32 = 0x100;

/// Resource type code "blkx"
const BLKX_TYPE: u32 = 0x626C_6B78;

/// One `blkx` entry from the resource fork
#[derive(Debug, Clone)]
pub struct RsrcEntry {
    /// ASCII name, truncated at the first byte outside `0x20..0x80`
    pub name: String,
    /// True when the stored name contained bytes outside printable ASCII
    /// and was therefore truncated
    pub name_is_approximate: bool,
    /// Raw `mish` table bytes
    pub table: Vec<u8>,
}

fn structure(msg: &str) -> DmgError {
    DmgError::InvalidStructure(msg.into())
}

/// Enumerate the `blkx` entries of a resource fork.
///
/// The caller guarantees `rsrc.len()` is between 0x100 and 2^24, so all
/// offset arithmetic fits in `u32`.
pub fn parse_blkx_entries(rsrc: &[u8]) -> Result<Vec<RsrcEntry>> {
    let rsrc_len = rsrc.len() as u32;
    if rsrc_len < RSRC_HEAD_SIZE {
        return Err(structure("resource fork too small"));
    }

    let head_size = BigEndian::read_u32(&rsrc[0..]);
    let footer_offset = BigEndian::read_u32(&rsrc[4..]);
    let main_data_size = BigEndian::read_u32(&rsrc[8..]);
    let footer_size = BigEndian::read_u32(&rsrc[12..]);

    if head_size != RSRC_HEAD_SIZE
        || footer_offset >= rsrc_len
        || main_data_size >= rsrc_len
        || footer_offset < main_data_size
        || footer_offset != head_size + main_data_size
    {
        return Err(structure("invalid resource fork header"));
    }

    let footer_end = footer_offset as u64 + footer_size as u64;
    if footer_end != rsrc_len as u64 {
        // A rare variant carries exactly four zero bytes of trailing padding
        let rem = rsrc_len - footer_offset;
        if (rem as u64) < footer_size as u64
            || rem - footer_size != 4
            || BigEndian::read_u32(&rsrc[footer_end as usize..]) != 0
        {
            return Err(structure("invalid resource fork footer"));
        }
    }

    let footer = &rsrc[footer_offset as usize..];
    if footer.len() < 0x1E {
        return Err(structure("resource map too small"));
    }

    // The footer opens with a duplicate of the 16-byte header
    if footer[..16] != rsrc[..16] {
        return Err(structure("resource fork header/footer mismatch"));
    }

    if BigEndian::read_u16(&footer[0x18..]) != 0x1C {
        return Err(structure("invalid resource map"));
    }

    let names_offset = BigEndian::read_u16(&footer[0x1A..]) as u32;
    if names_offset > footer_size {
        return Err(structure("invalid resource name list offset"));
    }

    let num_types = BigEndian::read_u16(&footer[0x1C..]) as usize + 1;
    if num_types * 8 + 0x1E > names_offset as usize {
        return Err(structure("invalid resource type count"));
    }

    let mut entries = Vec::new();

    for i in 0..num_types {
        let group = &footer[0x1E + i * 8..];
        if BigEndian::read_u32(&group[0..]) != BLKX_TYPE {
            continue;
        }

        let num_files = BigEndian::read_u16(&group[4..]) as usize + 1;
        let offs = BigEndian::read_u16(&group[6..]) as usize;
        if 0x1C + offs + 12 * num_files > names_offset as usize {
            return Err(structure("invalid resource entry offset"));
        }

        for k in 0..num_files {
            let record = &footer[0x1C + offs + k * 12..];
            let name_pos = BigEndian::read_u16(&record[2..]);

            // Only the low 24 bits of the data offset are trustworthy
            let block_offset = BigEndian::read_u32(&record[4..]) & 0x00FF_FFFF;
            if block_offset + 4 >= main_data_size {
                return Err(structure("invalid resource data offset"));
            }

            let block = &rsrc[(head_size + block_offset) as usize..];
            let block_size = BigEndian::read_u32(&block[0..]);
            if main_data_size - (block_offset + 4) < block_size {
                return Err(structure("invalid resource data size"));
            }

            let (name, name_is_approximate) = if name_pos != 0xFFFF {
                let names_block_size = footer_size - names_offset;
                if name_pos as u32 >= names_block_size {
                    return Err(structure("invalid resource name offset"));
                }

                let name_bytes = &footer[(names_offset + name_pos as u32) as usize..];
                let name_len = name_bytes[0] as usize;
                if names_block_size - name_pos as u32 <= name_len as u32 {
                    return Err(structure("invalid resource name length"));
                }

                let mut name = String::with_capacity(name_len);
                let mut truncated = false;
                for &c in &name_bytes[1..1 + name_len] {
                    if !(0x20..0x80).contains(&c) {
                        truncated = true;
                        break;
                    }
                    name.push(c as char);
                }
                (name, truncated)
            } else {
                (String::new(), false)
            };

            entries.push(RsrcEntry {
                name,
                name_is_approximate,
                table: block[4..4 + block_size as usize].to_vec(),
            });
        }
    }

    Ok(entries)
}
