//! DMG handler: the open pipeline and the file-list surface
//!
//! `DmgReader::open` locates the koly trailer, validates the four forks,
//! selects the directory encoding, builds the partition list and verifies
//! the master and data-fork checksums. Validation outcomes land in three
//! soft flags rather than aborting: many real-world images carry cosmetic
//! violations (blob garbage, a padded resource fork) while remaining
//! fully readable, and the caller decides on the trust threshold.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::blob;
use crate::checksum::{to_hex_lower, ChecksumRecord, CHECKSUM_SIZE_MAX};
use crate::error::{DmgError, Result};
use crate::format::{
    is_koly, ForkPair, KolyTrailer, KOLY_SIZE, METHOD_ADC, METHOD_BZIP2, METHOD_COPY,
    METHOD_LZFSE, METHOD_XZ, METHOD_ZERO_FILL, METHOD_ZERO_NOCRC, METHOD_ZLIB,
    SECTOR_NUMBER_LIMIT,
};
use crate::partition::Partition;
use crate::plist;
use crate::rsrc;
use crate::stream::{self, PartitionReader};

/// XML directories larger than this are rejected outright
const XML_SIZE_MAX: u64 = (1 << 31) - 256;

/// Resource-fork directory size window
const RSRC_SIZE_MIN: u64 = 0x100;
const RSRC_SIZE_MAX: u64 = 1 << 24;

/// Signature blobs larger than this are ignored
const BLOB_SIZE_MAX: u64 = 1 << 24;

/// Buffer size for streaming the data fork through CRC-32
const CRC_BUF_SIZE: usize = 1 << 15;

/// Parsed UDIF container: partition list, layout geometry and the soft
/// validation flags.
///
/// The handler never retains the byte source; `read_stream` takes it
/// again from the caller.
pub struct DmgReader {
    partitions: Vec<Partition>,
    /// Container offset of the image; nonzero for images appended to a
    /// larger file
    start_pos: u64,
    /// Size of the image within the container
    phys_size: u64,
    /// CodeDirectory identifier from the signature blob, if any
    name: String,
    rsrc_mode: bool,
    master_crc_error: bool,
    headers_error: bool,
    data_fork_error: bool,
    trailer: KolyTrailer,
}

impl DmgReader {
    /// Open a UDIF image from a seekable byte source.
    ///
    /// Fails only when no trailer is found or a structural read cannot
    /// complete; checksum mismatches and cross-file inconsistencies are
    /// recorded in the flags reported through [`info`](Self::info).
    pub fn open<R: Read + Seek>(source: &mut R) -> Result<DmgReader> {
        let file_size = source.seek(SeekFrom::End(0))?;
        if file_size < KOLY_SIZE as u64 {
            return Err(DmgError::NotUdif);
        }

        // Trailer at the end is the normal case; front koly is the fallback
        let mut header = [0u8; KOLY_SIZE];
        let mut header_pos = file_size - KOLY_SIZE as u64;
        source.seek(SeekFrom::Start(header_pos))?;
        source.read_exact(&mut header)?;

        let mut front_koly = false;
        if !is_koly(&header) {
            source.seek(SeekFrom::Start(0))?;
            source.read_exact(&mut header)?;
            if !is_koly(&header) {
                return Err(DmgError::NotUdif);
            }
            header_pos = 0;
            front_koly = true;
        }

        let trailer = KolyTrailer::parse(&header)?;

        // Images whose data fork starts right behind a 512-byte front
        // header use the front-koly layout even when a trailer also
        // exists at the end
        if trailer.data_fork.offset == KOLY_SIZE as u64 && (KOLY_SIZE as u64) < file_size {
            front_koly = true;
        }

        let limit = if front_koly { file_size } else { header_pos };
        let mut top = 0u64;
        if !trailer.data_fork.update_top(limit, &mut top) {
            return Err(DmgError::InvalidStructure("data fork out of bounds".into()));
        }
        if !trailer.xml_fork.update_top(limit, &mut top) {
            return Err(DmgError::InvalidStructure("xml fork out of bounds".into()));
        }
        if !trailer.rsrc_fork.update_top(limit, &mut top) {
            return Err(DmgError::InvalidStructure("resource fork out of bounds".into()));
        }
        // Old images stash garbage in the blob pair; skip it instead of failing
        let use_blob = trailer.blob_fork.update_top(limit, &mut top);

        let mut reader = DmgReader {
            partitions: Vec::new(),
            start_pos: 0,
            phys_size: 0,
            name: String::new(),
            rsrc_mode: false,
            master_crc_error: false,
            headers_error: false,
            data_fork_error: false,
            trailer,
        };

        if front_koly {
            reader.phys_size = top;
        } else {
            reader.phys_size = header_pos + KOLY_SIZE as u64;

            if top != header_pos {
                // The image may be a suffix of a larger container. Probe
                // the declared XML offset: absent an XML declaration
                // there, shift everything by the gap.
                let mut probe = [0u8; 4];
                let probe_ok = reader.trailer.xml_fork.len >= probe.len() as u64
                    && source
                        .seek(SeekFrom::Start(reader.trailer.xml_fork.offset))
                        .is_ok()
                    && source.read_exact(&mut probe).is_ok()
                    && &probe == b"<?xm";
                if !probe_ok {
                    reader.start_pos = header_pos - top;
                    reader.phys_size = top + KOLY_SIZE as u64;
                }
            }
        }

        if use_blob
            && reader.trailer.blob_fork.len != 0
            && reader.trailer.blob_fork.len <= BLOB_SIZE_MAX
        {
            let blob_buf = reader.read_fork(source, reader.trailer.blob_fork)?;
            match blob::code_directory_identifier(&blob_buf) {
                Ok(Some(identifier)) => reader.name = identifier,
                Ok(None) => {}
                Err(_) => reader.headers_error = true,
            }
        }

        if reader.trailer.xml_fork.len == 0 {
            // No XML: the resource fork must carry the directory
            let rsrc_pair = reader.trailer.rsrc_fork;
            if rsrc_pair.len < RSRC_SIZE_MIN || rsrc_pair.len > RSRC_SIZE_MAX {
                return Err(DmgError::InvalidStructure("missing or invalid resource fork".into()));
            }
            reader.rsrc_mode = true;

            let rsrc_buf = reader.read_fork(source, rsrc_pair)?;
            for entry in rsrc::parse_blkx_entries(&rsrc_buf)? {
                let mut partition = Partition::parse(entry.name, &entry.table)?;
                partition.name_is_approximate = entry.name_is_approximate;
                if !partition.is_correct {
                    reader.headers_error = true;
                }
                reader.partitions.push(partition);
            }
        } else {
            if reader.trailer.xml_fork.len > XML_SIZE_MAX {
                return Err(DmgError::InvalidStructure("xml directory too large".into()));
            }

            let xml_buf = reader.read_fork(source, reader.trailer.xml_fork)?;
            for entry in plist::parse_blkx(&xml_buf)? {
                let partition = Partition::parse(entry.name, &entry.table)?;
                if !partition.is_correct {
                    reader.headers_error = true;
                }
                reader.partitions.push(partition);
            }
        }

        reader.verify_master_checksum();
        reader.verify_sector_layout();
        reader.verify_data_fork_checksum(source)?;

        Ok(reader)
    }

    /// Fold the per-file checksum words and compare with the master CRC.
    /// A record with a fractional byte width, or one wider than the
    /// payload, terminates the fold.
    fn verify_master_checksum(&mut self) {
        if !self.trailer.master_checksum.is_crc32() {
            return;
        }
        let mut hasher = crc32fast::Hasher::new();
        for partition in &self.partitions {
            let checksum = &partition.checksum;
            if checksum.num_bits & 0x7 != 0 {
                break;
            }
            let len = (checksum.num_bits >> 3) as usize;
            if len > CHECKSUM_SIZE_MAX {
                break;
            }
            hasher.update(&checksum.data[..len]);
        }
        self.master_crc_error = hasher.finalize() != self.trailer.master_checksum.crc32();
    }

    /// Cross-file invariants: files tile the sector space in directory
    /// order and their total matches the trailer's sector count
    fn verify_sector_layout(&mut self) {
        let mut sector = 0u64;
        for partition in &self.partitions {
            if partition.start_unpack_sector != sector {
                self.headers_error = true;
            }
            if partition.num_unpack_sectors >= SECTOR_NUMBER_LIMIT {
                self.headers_error = true;
            }
            sector = sector.wrapping_add(partition.num_unpack_sectors);
            if sector >= SECTOR_NUMBER_LIMIT {
                self.headers_error = true;
            }
        }
        if sector != self.trailer.sector_count {
            self.headers_error = true;
        }
    }

    /// Stream the data-fork byte range through CRC-32 and compare
    fn verify_data_fork_checksum<R: Read + Seek>(&mut self, source: &mut R) -> Result<()> {
        if !self.trailer.data_fork_checksum.is_crc32() {
            return Ok(());
        }
        let pair = self.trailer.data_fork;
        let end_pos = match pair.end_pos() {
            Some(end) if pair.offset < 1u64 << 63 => end,
            _ => {
                self.headers_error = true;
                return Ok(());
            }
        };

        let seek_pos = self.start_pos + pair.offset;
        let source_size = source.seek(SeekFrom::End(0))?;
        if seek_pos > source_size || end_pos > source_size - self.start_pos {
            self.headers_error = true;
            return Ok(());
        }

        source.seek(SeekFrom::Start(seek_pos))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; CRC_BUF_SIZE];
        let mut pos = 0u64;
        loop {
            let cur = (buf.len() as u64).min(pair.len - pos) as usize;
            if cur == 0 {
                break;
            }
            source.read_exact(&mut buf[..cur])?;
            hasher.update(&buf[..cur]);
            pos += cur as u64;
        }

        if self.trailer.data_fork_checksum.crc32() != hasher.finalize() {
            self.data_fork_error = true;
        }
        Ok(())
    }

    fn read_fork<R: Read + Seek>(&self, source: &mut R, pair: ForkPair) -> Result<Vec<u8>> {
        source.seek(SeekFrom::Start(self.start_pos + pair.offset))?;
        let mut buf = vec![0u8; pair.len as usize];
        source.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Number of logical files in the image
    pub fn file_count(&self) -> usize {
        self.partitions.len()
    }

    /// File by directory index
    pub fn partition(&self, index: usize) -> Result<&Partition> {
        self.partitions
            .get(index)
            .ok_or_else(|| DmgError::BadArgument(format!("file index {index} out of range")))
    }

    /// All files, in directory order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The parsed trailer
    pub fn trailer(&self) -> &KolyTrailer {
        &self.trailer
    }

    /// CodeDirectory identifier from the signature blob; empty if none
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container offset of the image (nonzero for appended images)
    pub fn start_pos(&self) -> u64 {
        self.start_pos
    }

    /// Size of the image within the container
    pub fn phys_size(&self) -> u64 {
        self.phys_size
    }

    /// True when the directory came from the resource fork
    pub fn rsrc_mode(&self) -> bool {
        self.rsrc_mode
    }

    /// Open a read stream over one file. The caller re-supplies the byte
    /// source; the handler holds none.
    pub fn read_stream<R: Read + Seek>(
        &self,
        source: R,
        index: usize,
    ) -> Result<PartitionReader<'_, R>> {
        let partition = self.partition(index)?;
        stream::validate_for_stream(partition)?;
        Ok(PartitionReader::new(
            source,
            partition,
            self.start_pos + self.trailer.data_fork.offset,
        ))
    }

    /// Decompress one file completely into `writer`; returns the byte count
    pub fn extract_partition_to<R: Read + Seek, W: Write>(
        &self,
        source: R,
        index: usize,
        writer: &mut W,
    ) -> Result<u64> {
        let mut stream = self.read_stream(source, index)?;
        Ok(std::io::copy(&mut stream, writer)?)
    }

    /// Census of block methods used across all files
    pub fn compression_info(&self) -> CompressionInfo {
        let mut info = CompressionInfo::default();
        for partition in &self.partitions {
            for block in &partition.blocks {
                match block.method {
                    METHOD_ZERO_FILL => info.zero_fill_blocks += 1,
                    METHOD_COPY => info.copy_blocks += 1,
                    METHOD_ZERO_NOCRC => info.zero_no_crc_blocks += 1,
                    METHOD_ADC => info.adc_blocks += 1,
                    METHOD_ZLIB => info.zlib_blocks += 1,
                    METHOD_BZIP2 => info.bzip2_blocks += 1,
                    METHOD_LZFSE => info.lzfse_blocks += 1,
                    METHOD_XZ => info.xz_blocks += 1,
                    _ => {}
                }
            }
        }
        info
    }

    /// Summary of the image: sizes, validation outcomes and the
    /// annotations transcript
    pub fn info(&self) -> Info {
        Info {
            name: self.name.clone(),
            num_files: self.partitions.len(),
            unpacked_size: self.trailer.sector_count << 9,
            packed_size: self.trailer.data_fork.len,
            master_crc_ok: !self.master_crc_error,
            headers_ok: !self.headers_error,
            data_fork_ok: !self.data_fork_error,
            annotations: self.annotations(),
        }
    }

    /// Newline-terminated `key: value` transcript suitable for logging
    fn annotations(&self) -> String {
        let mut out = String::new();
        if !self.name.is_empty() {
            push_prop(&mut out, "Name", &self.name);
        }
        push_prop(&mut out, "unpack-size", &(self.trailer.sector_count << 9).to_string());
        push_prop(&mut out, "ID", &to_hex_lower(&self.trailer.segment_id));
        push_checksum(&mut out, "master-checksum", &self.trailer.master_checksum);
        push_checksum(&mut out, "pack-checksum", &self.trailer.data_fork_checksum);
        push_fork(&mut out, "pack", &self.trailer.data_fork);
        push_fork(&mut out, "rsrc", &self.trailer.rsrc_fork);
        push_fork(&mut out, "xml", &self.trailer.xml_fork);
        push_fork(&mut out, "blob", &self.trailer.blob_fork);
        if self.rsrc_mode {
            out.push_str("RSRC_MODE\n");
        }
        out
    }
}

fn push_prop(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

fn push_checksum(out: &mut String, name: &str, record: &ChecksumRecord) {
    let formatted = record.display();
    if !formatted.is_empty() {
        push_prop(out, name, &formatted);
    }
}

fn push_fork(out: &mut String, name: &str, pair: &ForkPair) {
    if pair.is_set() {
        push_prop(out, &format!("{name}-offset"), &pair.offset.to_string());
        push_prop(out, &format!("{name}-length"), &pair.len.to_string());
    }
}

/// Summary of an opened image
#[derive(Debug, Clone)]
pub struct Info {
    /// CodeDirectory identifier; empty when the image carries no signature
    pub name: String,
    pub num_files: usize,
    /// Declared decompressed size in bytes
    pub unpacked_size: u64,
    /// Data fork length in bytes
    pub packed_size: u64,
    pub master_crc_ok: bool,
    pub headers_ok: bool,
    pub data_fork_ok: bool,
    /// `key: value` transcript, one entry per line
    pub annotations: String,
}

/// Per-method block counts across the whole image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionInfo {
    pub zero_fill_blocks: u32,
    pub copy_blocks: u32,
    pub zero_no_crc_blocks: u32,
    pub adc_blocks: u32,
    pub zlib_blocks: u32,
    pub bzip2_blocks: u32,
    pub lzfse_blocks: u32,
    pub xz_blocks: u32,
}

impl CompressionInfo {
    /// Space-separated names of the methods present, in method-code order
    pub fn summary(&self) -> String {
        let counts = [
            (self.zero_fill_blocks, "Zero0"),
            (self.copy_blocks, "Copy"),
            (self.zero_no_crc_blocks, "Zero2"),
            (self.adc_blocks, "ADC"),
            (self.zlib_blocks, "ZLIB"),
            (self.bzip2_blocks, "BZip2"),
            (self.lzfse_blocks, "LZFSE"),
            (self.xz_blocks, "XZ"),
        ];
        let mut out = String::new();
        for (count, name) in counts {
            if count != 0 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(name);
            }
        }
        out
    }
}
