//! Content-defined chunking with a rolling hash
//!
//! Splits a byte stream into variable-size chunks whose boundaries depend
//! on content, so an insertion early in a file shifts at most the chunks
//! around the edit instead of re-cutting everything after it. A cut is
//! placed at the first offset past `min` where the low bits of a rolling
//! FNV-1a hash are all zero, or forcibly at `max`. Concatenating the
//! emitted chunks reproduces the input byte-for-byte.

use std::io::Read;

use thiserror::Error;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid chunker bounds: min {min}, max {max}, avg {avg}")]
    InvalidBounds { min: usize, max: usize, avg: usize },
}

/// Streaming content-defined chunker
///
/// Owns the input stream; not restartable.
pub struct Chunker<R: Read> {
    reader: R,
    min: usize,
    max: usize,
    mask: u32,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    /// Create a chunker emitting chunks of `min..=max` bytes with an
    /// expected average of `avg` (rounded down to a power of two for the
    /// boundary mask).
    pub fn new(reader: R, min: usize, max: usize, avg: usize) -> Result<Self, ChunkerError> {
        if min == 0 || max <= min || avg < min || avg > max {
            return Err(ChunkerError::InvalidBounds { min, max, avg });
        }
        // avg = 8192 gives a 13-bit mask
        let mask_bits = avg.next_power_of_two().trailing_zeros();
        Ok(Self {
            reader,
            min,
            max,
            mask: (1u32 << mask_bits) - 1,
            buf: Vec::with_capacity(max),
            eof: false,
        })
    }

    /// Emit the next chunk, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChunkerError> {
        self.fill_buffer()?;

        if self.buf.is_empty() {
            return Ok(None);
        }

        let cut = self.find_boundary();
        let rest = self.buf.split_off(cut);
        let chunk = std::mem::replace(&mut self.buf, rest);
        Ok(Some(chunk))
    }

    /// Top the buffer up to `max` bytes unless the stream is exhausted.
    fn fill_buffer(&mut self) -> Result<(), ChunkerError> {
        let mut scratch = [0u8; 8192];
        while !self.eof && self.buf.len() < self.max {
            let want = (self.max - self.buf.len()).min(scratch.len());
            let n = self.reader.read(&mut scratch[..want])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.buf.extend_from_slice(&scratch[..n]);
        }
        Ok(())
    }

    /// Scan the buffered bytes for a content boundary. Returns the chunk
    /// length: the first position at or past `min` where the rolling hash
    /// masks to zero, `max` if no boundary occurs, or the whole remainder
    /// on a short final chunk.
    fn find_boundary(&self) -> usize {
        let limit = self.buf.len().min(self.max);
        let mut hash = FNV_OFFSET_BASIS;
        for i in 0..limit {
            hash ^= u32::from(self.buf[i]);
            hash = hash.wrapping_mul(FNV_PRIME);
            let len = i + 1;
            if len >= self.min && hash & self.mask == 0 {
                return len;
            }
        }
        limit
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Vec<u8>, ChunkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
