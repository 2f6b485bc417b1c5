//! Seekable read stream over one partition
//!
//! Translates virtual byte positions through the sorted block table into
//! compressed source ranges. Zero runs are synthesized, copy blocks are
//! read straight from the source, and compressed blocks are decoded whole
//! into an LRU cache of chunks.

use std::io::{self, Read, Seek, SeekFrom};

use crate::decoder::Decoders;
use crate::error::{DmgError, Result};
use crate::format::METHOD_COPY;
use crate::partition::Partition;

/// Hard cap on cache slots; bounds cache metadata
pub(crate) const NUM_CHUNKS_MAX: usize = 128;

/// Largest decompressed block a stream will buffer (256 MiB)
pub const CHUNK_SIZE_MAX: u64 = 1 << 28;

/// Aggregate cache byte cap; unreachable in practice but stops runaway
/// growth on pathological images
pub(crate) const CHUNKS_TOTAL_SIZE_MAX: u64 = 1 << 40;

/// One cache slot holding a decompressed block
struct Chunk {
    block_index: Option<usize>,
    access_mark: u64,
    buf: Vec<u8>,
}

/// Reject partitions a stream cannot serve: inconsistent tables, blocks
/// too large to buffer, or unrecognized method codes. LZFSE passes here
/// and fails only when a read reaches it.
pub(crate) fn validate_for_stream(partition: &Partition) -> Result<()> {
    if !partition.is_correct {
        return Err(DmgError::InvalidStructure("partition block table is not consistent".into()));
    }
    for (index, block) in partition.blocks.iter().enumerate() {
        if !block.needs_buffer() {
            continue;
        }
        if partition.block_unpacked_size(index) > CHUNK_SIZE_MAX {
            return Err(DmgError::InvalidStructure("block exceeds the chunk size limit".into()));
        }
        block.block_type()?;
    }
    Ok(())
}

/// Seekable reader over one partition's decompressed content.
///
/// Borrows the partition from its handler and owns (or borrows) the byte
/// source the caller re-supplied. Reads never cross a block boundary in
/// one call; positions past the end are legal and read as end-of-stream.
pub struct PartitionReader<'a, R> {
    source: R,
    partition: &'a Partition,
    /// Absolute source position of the data fork plus any container offset
    pack_base: u64,
    virt_pos: u64,
    size: u64,
    latest_block: Option<usize>,
    latest_chunk: Option<usize>,
    access_mark: u64,
    chunks: Vec<Chunk>,
    chunks_total_size: u64,
    decoders: Decoders,
    failed: Option<io::ErrorKind>,
}

impl<'a, R: Read + Seek> PartitionReader<'a, R> {
    pub(crate) fn new(source: R, partition: &'a Partition, pack_base: u64) -> Self {
        PartitionReader {
            source,
            partition,
            pack_base,
            virt_pos: 0,
            size: partition.size,
            latest_block: None,
            latest_chunk: None,
            access_mark: 0,
            chunks: Vec::new(),
            chunks_total_size: 0,
            decoders: Decoders::new(),
            failed: None,
        }
    }

    /// Current virtual position
    pub fn position(&self) -> u64 {
        self.virt_pos
    }

    /// Decompressed size of the partition
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Index of the block containing `pos`. The table is sorted and
    /// gap-free by construction, so the last block starting at or before
    /// `pos` is the one.
    fn find_block(&self, pos: u64) -> usize {
        self.partition.blocks.partition_point(|b| b.unp_pos <= pos) - 1
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.virt_pos >= self.size {
            return Ok(0);
        }
        let mut to_read = (buf.len() as u64).min(self.size - self.virt_pos);

        // Drop the block memo once the cursor leaves it
        if let Some(index) = self.latest_block {
            let block = &self.partition.blocks[index];
            let unp_size = self.partition.block_unpacked_size(index);
            if self.virt_pos < block.unp_pos || self.virt_pos - block.unp_pos >= unp_size {
                self.latest_block = None;
            }
        }

        if self.latest_block.is_none() {
            self.latest_chunk = None;
            let index = self.find_block(self.virt_pos);
            let block = &self.partition.blocks[index];
            let unp_size = self.partition.block_unpacked_size(index);

            if block.needs_buffer() && unp_size <= CHUNK_SIZE_MAX {
                match self.chunks.iter().position(|c| c.block_index == Some(index)) {
                    Some(ci) => self.latest_chunk = Some(ci),
                    None => self.latest_chunk = Some(self.load_block(index)?),
                }
            }
            self.latest_block = Some(index);
        }

        let index = self.latest_block.unwrap();
        let block = &self.partition.blocks[index];
        let offset = self.virt_pos - block.unp_pos;

        // Never cross the block boundary in a single call
        let block_size = self.partition.block_unpacked_size(index);
        if offset + to_read > block_size {
            to_read = block_size - offset;
        }
        let n = to_read as usize;

        if block.is_zero_method() {
            buf[..n].fill(0);
        } else if let Some(ci) = self.latest_chunk {
            let chunk = &mut self.chunks[ci];
            buf[..n].copy_from_slice(&chunk.buf[offset as usize..offset as usize + n]);
            chunk.access_mark = self.access_mark;
            self.access_mark += 1;
        } else if block.method == METHOD_COPY {
            let src_pos = self.pack_base + self.partition.start_pack_pos + block.pack_pos + offset;
            self.source.seek(SeekFrom::Start(src_pos))?;
            self.source.read_exact(&mut buf[..n])?;
        } else {
            return Err(DmgError::InvalidStructure("block exceeds the chunk size limit".into()));
        }

        self.virt_pos += to_read;
        Ok(n)
    }

    /// Decode a block into a cache slot, evicting the least recently
    /// touched chunk once both slot count and byte caps are reached.
    fn load_block(&mut self, index: usize) -> Result<usize> {
        let block = &self.partition.blocks[index];
        let unp_size = self.partition.block_unpacked_size(index);

        let ci = if self.chunks.len() < NUM_CHUNKS_MAX
            && self.chunks_total_size + unp_size <= CHUNKS_TOTAL_SIZE_MAX
        {
            self.chunks.push(Chunk {
                block_index: None,
                access_mark: 0,
                buf: Vec::new(),
            });
            self.chunks.len() - 1
        } else {
            let ci = self
                .chunks
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.access_mark)
                .map(|(i, _)| i)
                .ok_or_else(|| DmgError::InvalidStructure("no cache slot available".into()))?;
            self.chunks_total_size -= self.chunks[ci].buf.len() as u64;
            self.chunks[ci].buf = Vec::new();
            ci
        };

        let chunk = &mut self.chunks[ci];
        chunk.block_index = None;
        chunk.access_mark = self.access_mark;
        self.access_mark += 1;
        chunk.buf = vec![0u8; unp_size as usize];
        self.chunks_total_size += unp_size;

        self.source
            .seek(SeekFrom::Start(self.pack_base + self.partition.start_pack_pos + block.pack_pos))?;

        let block_type = block.block_type()?;
        let mut limited = Read::take(&mut self.source, block.pack_size);
        self.decoders.decode(block_type, &mut limited, &mut chunk.buf)?;

        chunk.block_index = Some(index);
        Ok(ci)
    }
}

impl<R: Read + Seek> Read for PartitionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Sticky failure: once a read fails, later reads fail the same way
        if let Some(kind) = self.failed {
            return Err(io::Error::new(kind, "stream previously failed"));
        }
        match self.read_inner(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let e: io::Error = e.into();
                self.failed = Some(e.kind());
                Err(e)
            }
        }
    }
}

impl<R: Read + Seek> Seek for PartitionReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(delta) => self.virt_pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
        };
        if new_pos < 0 || new_pos > u64::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                DmgError::BadArgument("seek to a negative position".into()),
            ));
        }
        self.virt_pos = new_pos as u64;
        Ok(self.virt_pos)
    }
}
