//! Block decompression, routed by method code
//!
//! Every decoder reads from a view limited to the block's packed size and
//! must fill exactly the block's declared decompressed size; anything
//! else is reported as corruption. LZFSE blocks are recognized but
//! refused.

use std::io::Read;

use crate::adc::AdcDecoder;
use crate::error::{DmgError, Result};
use crate::format::{BlockType, METHOD_LZFSE};

/// Read from a decoder until the buffer is full or EOF.
/// Unlike `read()`, this loops to handle decoders that return partial data.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..])? {
            0 => break, // EOF
            n => total += n,
        }
    }
    Ok(total)
}

/// Per-stream decoder set. ADC keeps a sliding window across calls, so
/// the set is owned by one read stream and never shared.
pub(crate) struct Decoders {
    adc: AdcDecoder,
}

impl Decoders {
    pub fn new() -> Self {
        Decoders {
            adc: AdcDecoder::new(),
        }
    }

    /// Decompress one block's payload into `out`. `input` must already be
    /// limited to the block's packed size.
    pub fn decode<R: Read>(
        &mut self,
        block_type: BlockType,
        input: &mut R,
        out: &mut [u8],
    ) -> Result<()> {
        match block_type {
            BlockType::ZeroFill | BlockType::ZeroNoCrc => {
                out.fill(0);
                Ok(())
            }
            BlockType::Copy => {
                match read_full(input, out) {
                    Ok(n) if n == out.len() => Ok(()),
                    Ok(_) => Err(DmgError::Corrupt("copy: packed size mismatch".into())),
                    Err(e) => Err(e.into()),
                }
            }
            BlockType::Adc => {
                // ADC consumes its input byte-wise
                let mut buffered = std::io::BufReader::with_capacity(1 << 16, input);
                self.adc.decode(&mut buffered, out)
            }
            BlockType::Zlib => exact_fill(&mut flate2::read::ZlibDecoder::new(input), out, "zlib"),
            BlockType::Bzip2 => exact_fill(&mut bzip2::read::BzDecoder::new(input), out, "bzip2"),
            BlockType::Xz => exact_fill(&mut xz2::read::XzDecoder::new(input), out, "xz"),
            BlockType::Lzfse => Err(DmgError::UnsupportedMethod(METHOD_LZFSE)),
            BlockType::Comment | BlockType::End => {
                Err(DmgError::Corrupt("marker block carries no data".into()))
            }
        }
    }
}

/// Drain a decompressor into `out` and demand an exact fill. The
/// compressed bytes were bounds-checked up front, so every decoder error
/// here means corrupt data rather than a source failure.
fn exact_fill<R: Read>(decoder: &mut R, out: &mut [u8], codec: &str) -> Result<()> {
    match read_full(decoder, out) {
        Ok(n) if n == out.len() => Ok(()),
        Ok(n) => Err(DmgError::Corrupt(format!(
            "{codec}: decompressed {n} bytes, expected {}",
            out.len()
        ))),
        Err(e) => Err(DmgError::Corrupt(format!("{codec}: {e}"))),
    }
}
