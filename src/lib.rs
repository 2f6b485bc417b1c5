//! dmgread - read-only DMG (UDIF) parser and decompression engine
//!
//! A cross-platform library for inspecting Apple disk images and reading
//! their content with random access.
//!
//! # Features
//!
//! - **Discover** the koly trailer at either end of the container,
//!   including images appended to a larger file
//! - **List** the logical files (partitions) from the XML plist or the
//!   legacy resource-fork directory
//! - **Read** arbitrary byte ranges of any file through a seekable
//!   stream with an LRU cache of decompressed blocks
//! - **Verify** the master and data-fork CRC-32 checksums, reported as
//!   status flags rather than hard failures
//!
//! # Supported Compression
//!
//! - Raw (uncompressed) and zero-filled runs
//! - Zlib
//! - Bzip2
//! - ADC (Apple Data Compression)
//! - XZ
//! - LZFSE blocks are recognized and reported, but not decoded
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//!
//! fn main() -> dmgread::Result<()> {
//!     let (dmg, mut source) = dmgread::open_path("image.dmg")?;
//!
//!     for partition in dmg.partitions() {
//!         println!("{}: {} bytes", partition.name, partition.size);
//!     }
//!
//!     // Random access into the first file
//!     let mut stream = dmg.read_stream(&mut source, 0)?;
//!     let mut buf = vec![0u8; 4096];
//!     stream.read_exact(&mut buf).map_err(dmgread::DmgError::from)?;
//!
//!     Ok(())
//! }
//! ```

pub mod adc;
pub mod blob;
pub mod checksum;
mod decoder;
pub mod error;
pub mod format;
pub mod partition;
pub mod plist;
pub mod reader;
pub mod rsrc;
pub mod stream;

#[cfg(test)]
mod testimg;

pub use adc::AdcDecoder;
pub use checksum::{crc32, ChecksumRecord, CHECKSUM_TYPE_CRC32};
pub use error::{DmgError, Result};
pub use format::{Block, BlockType, ForkPair, KolyTrailer, KOLY_SIGNATURE, KOLY_SIZE};
pub use partition::{apple_fs_extension, Partition, PartitionType};
pub use reader::{CompressionInfo, DmgReader, Info};
pub use stream::{PartitionReader, CHUNK_SIZE_MAX};

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Open a UDIF image from a seekable byte source
pub fn open<R: Read + Seek>(source: &mut R) -> Result<DmgReader> {
    DmgReader::open(source)
}

/// Open a UDIF image from a path. The source is handed back so the
/// caller can feed it to [`DmgReader::read_stream`].
pub fn open_path<P: AsRef<Path>>(path: P) -> Result<(DmgReader, BufReader<File>)> {
    let mut source = BufReader::new(File::open(path)?);
    let dmg = DmgReader::open(&mut source)?;
    Ok((dmg, source))
}

/// Quick check whether a source looks like a UDIF image: a koly trailer
/// at the tail or at offset 0. The stream position is restored.
pub fn is_udif<R: Read + Seek>(source: &mut R) -> bool {
    let saved = source.stream_position().ok();

    let result = (|| {
        let size = source.seek(SeekFrom::End(0))?;
        if size < KOLY_SIZE as u64 {
            return Ok::<_, std::io::Error>(false);
        }

        let mut magic = [0u8; KOLY_SIGNATURE.len()];
        source.seek(SeekFrom::Start(size - KOLY_SIZE as u64))?;
        source.read_exact(&mut magic)?;
        if magic == KOLY_SIGNATURE {
            return Ok(true);
        }

        source.seek(SeekFrom::Start(0))?;
        source.read_exact(&mut magic)?;
        Ok(magic == KOLY_SIGNATURE)
    })();

    if let Some(pos) = saved {
        let _ = source.seek(SeekFrom::Start(pos));
    }

    result.unwrap_or(false)
}
