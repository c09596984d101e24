//! Content-addressed chunk store
//!
//! Chunks are keyed by the hex SHA-256 of their plaintext and stored as
//! `nonce || ciphertext || tag`. A chunk is written at most once; a second
//! put of equal plaintext is a no-op. Inbound chunks from peers arrive as
//! raw encrypted bytes and are admitted only if they decrypt under the
//! repository master key to plaintext matching the claimed address.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::compression::{self, Compression, CompressionError};
use crate::crypto::{decrypt, encrypt, ChunkHash, EncryptionError, MasterKey};
use crate::storage::db::Database;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("chunk not found: {0}")]
    NotFound(ChunkHash),
    #[error("chunk corrupt: {0}")]
    Corrupt(ChunkHash),
    #[error("chunk content does not match claimed address {claimed}")]
    IntegrityMismatch { claimed: ChunkHash },
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
}

/// Encrypted content-addressed store over the `blocks` tree
pub struct ChunkStore {
    db: Arc<Database>,
    master_key: MasterKey,
    compression: Compression,
}

impl ChunkStore {
    pub fn new(db: Arc<Database>, master_key: MasterKey, compression: Compression) -> Self {
        Self {
            db,
            master_key,
            compression,
        }
    }

    /// Store a plaintext chunk, returning its content address.
    ///
    /// Idempotent: if the address is already present the store is not
    /// touched and no new ciphertext is produced.
    pub fn put_chunk(&self, plaintext: &[u8]) -> Result<ChunkHash, StorageError> {
        let hash = ChunkHash::from_plaintext(plaintext);
        let key = hash.to_hex();

        let _guard = self.db.write_guard();
        if self.db.blocks().contains_key(key.as_bytes())? {
            debug!(chunk = %hash, "chunk already stored, deduplicated");
            return Ok(hash);
        }

        let payload = self.compression.encode(plaintext)?;
        let stored = encrypt(&self.master_key, &payload)?;
        self.db.blocks().insert(key.as_bytes(), stored)?;
        Ok(hash)
    }

    /// Retrieve and decrypt a chunk's plaintext.
    pub fn get_chunk(&self, hash: &ChunkHash) -> Result<Vec<u8>, StorageError> {
        let stored = self.get_raw(hash)?;
        let payload =
            decrypt(&self.master_key, &stored).map_err(|_| StorageError::Corrupt(*hash))?;
        compression::decode(&payload).map_err(|_| StorageError::Corrupt(*hash))
    }

    /// Retrieve the stored wire form, `nonce || ciphertext || tag`.
    pub fn get_raw(&self, hash: &ChunkHash) -> Result<Vec<u8>, StorageError> {
        self.db
            .blocks()
            .get(hash.to_hex().as_bytes())?
            .map(|v| v.to_vec())
            .ok_or(StorageError::NotFound(*hash))
    }

    /// Admit raw encrypted bytes received from a peer.
    ///
    /// The bytes must decrypt under the repository master key and hash to
    /// the claimed address; anything else is rejected before it can land
    /// in the store.
    pub fn put_raw(&self, hash: &ChunkHash, raw: &[u8]) -> Result<(), StorageError> {
        let payload = decrypt(&self.master_key, raw)
            .map_err(|_| StorageError::IntegrityMismatch { claimed: *hash })?;
        let plaintext = compression::decode(&payload)
            .map_err(|_| StorageError::IntegrityMismatch { claimed: *hash })?;
        if ChunkHash::from_plaintext(&plaintext) != *hash {
            warn!(claimed = %hash, "inbound chunk content mismatch, rejecting");
            return Err(StorageError::IntegrityMismatch { claimed: *hash });
        }

        let _guard = self.db.write_guard();
        self.db.blocks().insert(hash.to_hex().as_bytes(), raw)?;
        Ok(())
    }

    /// Delete a chunk. Deleting an absent chunk is a no-op.
    pub fn delete(&self, hash: &ChunkHash) -> Result<(), StorageError> {
        let _guard = self.db.write_guard();
        self.db.blocks().remove(hash.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn exists(&self, hash: &ChunkHash) -> Result<bool, StorageError> {
        Ok(self.db.blocks().contains_key(hash.to_hex().as_bytes())?)
    }

    /// List every stored content address.
    pub fn list_all(&self) -> Result<Vec<ChunkHash>, StorageError> {
        let mut hashes = Vec::new();
        for item in self.db.blocks().iter() {
            let (key, _) = item?;
            if let Ok(text) = std::str::from_utf8(&key) {
                if let Ok(hash) = ChunkHash::from_hex(text) {
                    hashes.push(hash);
                }
            }
        }
        Ok(hashes)
    }

    /// Number of stored chunks.
    pub fn chunk_count(&self) -> usize {
        self.db.blocks().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let store = ChunkStore::new(db, MasterKey::from_bytes([9u8; 32]), Compression::None);
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = open_store();
        let hash = store.put_chunk(b"chunk body").unwrap();
        assert_eq!(store.get_chunk(&hash).unwrap(), b"chunk body");
    }

    #[test]
    fn test_dedup_single_entry() {
        let (_dir, store) = open_store();
        let h1 = store.put_chunk(b"same bytes").unwrap();
        let h2 = store.put_chunk(b"same bytes").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn test_dedup_does_not_rewrite_ciphertext() {
        let (_dir, store) = open_store();
        let hash = store.put_chunk(b"stable").unwrap();
        let raw1 = store.get_raw(&hash).unwrap();
        store.put_chunk(b"stable").unwrap();
        let raw2 = store.get_raw(&hash).unwrap();
        // A rewrite would use a fresh nonce and change the stored bytes
        assert_eq!(raw1, raw2);
    }

    #[test]
    fn test_missing_chunk_not_found() {
        let (_dir, store) = open_store();
        let absent = ChunkHash::from_plaintext(b"never stored");
        assert!(matches!(
            store.get_chunk(&absent),
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.exists(&absent).unwrap());
    }

    #[test]
    fn test_put_raw_roundtrip() {
        let (_dir, store) = open_store();
        let hash = store.put_chunk(b"replicated").unwrap();
        let raw = store.get_raw(&hash).unwrap();
        store.delete(&hash).unwrap();
        assert!(!store.exists(&hash).unwrap());

        store.put_raw(&hash, &raw).unwrap();
        assert_eq!(store.get_chunk(&hash).unwrap(), b"replicated");
    }

    #[test]
    fn test_put_raw_rejects_wrong_content() {
        let (_dir, store) = open_store();
        let hash_a = store.put_chunk(b"content a").unwrap();
        let hash_b = ChunkHash::from_plaintext(b"content b");
        let raw_a = store.get_raw(&hash_a).unwrap();

        // Valid ciphertext offered under the wrong address
        assert!(matches!(
            store.put_raw(&hash_b, &raw_a),
            Err(StorageError::IntegrityMismatch { .. })
        ));
        assert!(!store.exists(&hash_b).unwrap());
    }

    #[test]
    fn test_put_raw_rejects_garbage() {
        let (_dir, store) = open_store();
        let hash = ChunkHash::from_plaintext(b"whatever");
        assert!(store.put_raw(&hash, b"not an encrypted chunk").is_err());
    }

    #[test]
    fn test_corrupted_value_detected_on_get() {
        let (_dir, store) = open_store();
        let hash = store.put_chunk(b"will corrupt").unwrap();
        let mut raw = store.get_raw(&hash).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        store
            .db
            .blocks()
            .insert(hash.to_hex().as_bytes(), raw)
            .unwrap();

        assert!(matches!(
            store.get_chunk(&hash),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_list_all() {
        let (_dir, store) = open_store();
        let h1 = store.put_chunk(b"one").unwrap();
        let h2 = store.put_chunk(b"two").unwrap();
        let mut listed = store.list_all().unwrap();
        listed.sort();
        let mut expected = vec![h1, h2];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_compressed_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let store = ChunkStore::new(
            db,
            MasterKey::from_bytes([9u8; 32]),
            Compression::from_flag(true),
        );
        let data = b"abc".repeat(10_000);
        let hash = store.put_chunk(&data).unwrap();
        assert_eq!(store.get_chunk(&hash).unwrap(), data);
        // Address still derives from the uncompressed plaintext
        assert_eq!(hash, ChunkHash::from_plaintext(&data));
    }
}
