//! Snapshot integrity verification and repair
//!
//! Verification proves that every chunk a snapshot references is present,
//! decrypts under the repository key, and hashes back to its address, and
//! that the descriptor signature is genuine. Repair pulls missing chunks
//! through an injected fetch; corrupted chunks are reported but never
//! re-fetched automatically, since content that decrypts but hashes wrong
//! usually means a key mismatch rather than damage a peer can mend.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::ChunkHash;
use crate::snapshot::{repository::RepositoryError, SnapshotRepository};
use crate::storage::{ChunkStore, StorageError};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of verifying one snapshot
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub snapshot_id: String,
    pub total_chunks: usize,
    pub verified_chunks: usize,
    pub missing_chunks: Vec<ChunkHash>,
    pub corrupted_chunks: Vec<ChunkHash>,
    pub signature_valid: bool,
    pub success: bool,
}

/// Verifies snapshots against the chunk store
pub struct Verifier {
    snapshots: Arc<SnapshotRepository>,
    store: Arc<ChunkStore>,
}

enum ChunkState {
    Verified,
    Missing,
    Corrupted,
}

impl Verifier {
    pub fn new(snapshots: Arc<SnapshotRepository>, store: Arc<ChunkStore>) -> Self {
        Self { snapshots, store }
    }

    /// Full verification of one snapshot.
    pub fn verify(&self, snapshot_id: &str) -> Result<VerificationResult, VerifyError> {
        let snapshot = self.snapshots.load(snapshot_id)?;

        let signature_valid = snapshot.verify_signature();
        if !signature_valid {
            warn!(snapshot_id, "snapshot signature verification failed");
        }

        let mut result = VerificationResult {
            snapshot_id: snapshot_id.to_string(),
            total_chunks: snapshot.chunks.len(),
            verified_chunks: 0,
            missing_chunks: Vec::new(),
            corrupted_chunks: Vec::new(),
            signature_valid,
            success: false,
        };

        for hash in &snapshot.chunks {
            match self.check_chunk(hash)? {
                ChunkState::Verified => result.verified_chunks += 1,
                ChunkState::Missing => {
                    warn!(chunk = %hash, "missing chunk");
                    result.missing_chunks.push(*hash);
                }
                ChunkState::Corrupted => {
                    warn!(chunk = %hash, "corrupted chunk");
                    result.corrupted_chunks.push(*hash);
                }
            }
        }

        result.success = result.signature_valid
            && result.missing_chunks.is_empty()
            && result.corrupted_chunks.is_empty();

        info!(
            snapshot_id,
            total = result.total_chunks,
            verified = result.verified_chunks,
            missing = result.missing_chunks.len(),
            corrupted = result.corrupted_chunks.len(),
            signature_valid = result.signature_valid,
            success = result.success,
            "snapshot verification completed"
        );
        Ok(result)
    }

    fn check_chunk(&self, hash: &ChunkHash) -> Result<ChunkState, VerifyError> {
        match self.store.get_raw(hash) {
            Err(StorageError::NotFound(_)) => return Ok(ChunkState::Missing),
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }
        match self.store.get_chunk(hash) {
            Ok(plaintext) => {
                if ChunkHash::from_plaintext(&plaintext) == *hash {
                    Ok(ChunkState::Verified)
                } else {
                    Ok(ChunkState::Corrupted)
                }
            }
            Err(StorageError::Corrupt(_)) => Ok(ChunkState::Corrupted),
            Err(err) => Err(err.into()),
        }
    }

    /// Existence-only check, no decryption.
    pub fn quick_check(&self, snapshot_id: &str) -> Result<bool, VerifyError> {
        let snapshot = self.snapshots.load(snapshot_id)?;
        for hash in &snapshot.chunks {
            if !self.store.exists(hash)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Verify, pull missing chunks through `fetch_fn`, verify again.
    ///
    /// One failed chunk does not abort the repair of the others.
    pub async fn repair<F, Fut, E>(
        &self,
        snapshot_id: &str,
        fetch_fn: F,
    ) -> Result<VerificationResult, VerifyError>
    where
        F: Fn(ChunkHash) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: Display,
    {
        let result = self.verify(snapshot_id)?;
        if result.success {
            info!(snapshot_id, "snapshot already valid, no repair needed");
            return Ok(result);
        }

        for hash in &result.missing_chunks {
            info!(chunk = %hash, "fetching missing chunk");
            match fetch_fn(*hash).await {
                Ok(raw) => {
                    if let Err(err) = self.store.put_raw(hash, &raw) {
                        warn!(chunk = %hash, %err, "fetched chunk rejected");
                    }
                }
                Err(err) => warn!(chunk = %hash, %err, "failed to fetch chunk"),
            }
        }

        let repaired = self.verify(snapshot_id)?;
        if repaired.success {
            info!(snapshot_id, "snapshot repair successful");
        } else {
            warn!(
                snapshot_id,
                missing = repaired.missing_chunks.len(),
                corrupted = repaired.corrupted_chunks.len(),
                "snapshot repair incomplete"
            );
        }
        Ok(repaired)
    }
}
