//! Embedded code-signature blob parsing
//!
//! Signed images append an Apple SuperBlob after the data fork. Only the
//! CodeDirectory identifier string is extracted; certificate chains are
//! not validated here.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DmgError, Result};

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;

/// Identifier strings longer than this are cut short
const IDENTIFIER_LEN_MAX: u32 = 1 << 8;

fn malformed() -> DmgError {
    DmgError::InvalidStructure("malformed code signature blob".into())
}

/// Walk a SuperBlob and return the CodeDirectory identifier, if present.
///
/// A buffer that does not start with the embedded-signature magic is not
/// an error; old images stash unrelated data in the blob fork. A buffer
/// that claims to be a SuperBlob but breaks its own framing is.
pub fn code_directory_identifier(data: &[u8]) -> Result<Option<String>> {
    const HEADER_SIZE: u32 = 3 * 4;
    if (data.len() as u64) < HEADER_SIZE as u64 {
        return Err(malformed());
    }
    if BigEndian::read_u32(&data[0..]) != CSMAGIC_EMBEDDED_SIGNATURE {
        return Ok(None);
    }

    let total_size = BigEndian::read_u32(&data[4..]);
    if total_size as usize != data.len() {
        return Err(malformed());
    }

    let num_entries = BigEndian::read_u32(&data[8..]);
    if num_entries as usize > (data.len() - HEADER_SIZE as usize) / 8 {
        return Err(malformed());
    }

    let index_limit = num_entries * 8 + HEADER_SIZE;
    let mut identifier = None;

    let mut i = HEADER_SIZE;
    while i < index_limit {
        let offset = BigEndian::read_u32(&data[(i + 4) as usize..]);
        if offset < index_limit || offset as usize > data.len() - 8 {
            return Err(malformed());
        }

        // Sub-blob offsets are not 4-aligned in general
        let sub = &data[offset as usize..];
        let magic = BigEndian::read_u32(&sub[0..]);
        let length = BigEndian::read_u32(&sub[4..]);
        if ((data.len() - offset as usize) as u64) < length as u64 || length < 8 {
            return Err(malformed());
        }

        if magic == CSMAGIC_CODEDIRECTORY {
            // The identifier offset lives at +20 within the CodeDirectory
            if length < 11 * 4 {
                return Err(malformed());
            }
            let id_offset = BigEndian::read_u32(&sub[20..]);
            if id_offset >= length {
                return Err(malformed());
            }

            let mut len = length - id_offset;
            if len > IDENTIFIER_LEN_MAX {
                len = IDENTIFIER_LEN_MAX;
            }
            let raw = &sub[id_offset as usize..(id_offset + len) as usize];
            let raw = match raw.iter().position(|&b| b == 0) {
                Some(nul) => &raw[..nul],
                None => raw,
            };
            identifier = Some(String::from_utf8_lossy(raw).into_owned());
        }

        i += 8;
    }

    Ok(identifier)
}
