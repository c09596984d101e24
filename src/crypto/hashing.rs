//! Content addressing using SHA-256
//!
//! Every chunk is identified by the SHA-256 hash of its plaintext,
//! encoded as lowercase hex. This enables:
//! - Deduplication (same content = same hash)
//! - Integrity verification
//! - A stable name on the wire independent of the encryption nonce

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A content address: SHA-256 of a chunk's plaintext
///
/// Serializes as lowercase hex, the form used in snapshot descriptors and
/// protocol messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash(pub [u8; 32]);

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ChunkHash::from_hex(&text).map_err(de::Error::custom)
    }
}

impl ChunkHash {
    /// Compute the content address for given plaintext
    pub fn from_plaintext(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, the canonical textual form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({}...)", &self.to_hex()[..8])
    }
}

/// Verify that plaintext matches its claimed content address
pub fn verify_plaintext(hash: &ChunkHash, data: &[u8]) -> bool {
    ChunkHash::from_plaintext(data) == *hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_hash() {
        let data = b"test data";
        assert_eq!(ChunkHash::from_plaintext(data), ChunkHash::from_plaintext(data));
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(
            ChunkHash::from_plaintext(b"data1"),
            ChunkHash::from_plaintext(b"data2")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = ChunkHash::from_plaintext(b"test");
        let parsed = ChunkHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_known_vector() {
        // SHA-256 of the empty string
        let hash = ChunkHash::from_plaintext(b"");
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(ChunkHash::from_hex("abcd").is_err());
        assert!(ChunkHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let hash = ChunkHash::from_plaintext(b"wire form");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ChunkHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
