//! Optional chunk compression
//!
//! Chunk plaintext can be compressed with zstd before encryption. The
//! encoded payload carries a 1-byte algorithm prefix so repositories
//! written with compression on and off stay mutually readable.

use std::io;

use thiserror::Error;

/// Default zstd level, balancing speed and ratio.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

const PREFIX_NONE: u8 = 0;
const PREFIX_ZSTD: u8 = 1;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(io::Error),
    #[error("decompression failed: {0}")]
    Decompress(io::Error),
    #[error("unknown compression prefix: {0}")]
    UnknownPrefix(u8),
    #[error("payload is empty")]
    Empty,
}

/// Compression codec applied to chunk plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Compression::Zstd {
                level: DEFAULT_ZSTD_LEVEL,
            }
        } else {
            Compression::None
        }
    }

    /// Encode plaintext into a prefixed payload.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => {
                let mut out = Vec::with_capacity(1 + plaintext.len());
                out.push(PREFIX_NONE);
                out.extend_from_slice(plaintext);
                Ok(out)
            }
            Compression::Zstd { level } => {
                let compressed =
                    zstd::stream::encode_all(plaintext, *level).map_err(CompressionError::Compress)?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(PREFIX_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            }
        }
    }
}

/// Decode a prefixed payload back into plaintext.
///
/// Decoding is driven by the stored prefix, not the configured codec, so
/// chunks written under a different compression setting remain readable.
pub fn decode(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&prefix, body) = payload.split_first().ok_or(CompressionError::Empty)?;
    match prefix {
        PREFIX_NONE => Ok(body.to_vec()),
        PREFIX_ZSTD => zstd::stream::decode_all(body).map_err(CompressionError::Decompress),
        other => Err(CompressionError::UnknownPrefix(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_roundtrip() {
        let payload = Compression::None.encode(b"plain bytes").unwrap();
        assert_eq!(payload[0], PREFIX_NONE);
        assert_eq!(decode(&payload).unwrap(), b"plain bytes");
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data = b"abc".repeat(10_000);
        let payload = Compression::from_flag(true).encode(&data).unwrap();
        assert_eq!(payload[0], PREFIX_ZSTD);
        assert!(payload.len() < data.len());
        assert_eq!(decode(&payload).unwrap(), data);
    }

    #[test]
    fn test_cross_setting_readability() {
        // Written uncompressed, read back regardless of current setting
        let payload = Compression::None.encode(b"old chunk").unwrap();
        assert_eq!(decode(&payload).unwrap(), b"old chunk");
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        assert!(matches!(
            decode(&[9u8, 1, 2, 3]),
            Err(CompressionError::UnknownPrefix(9))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode(&[]), Err(CompressionError::Empty)));
    }
}
