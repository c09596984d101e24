//! Snapshot descriptors
//!
//! A snapshot names an ordered sequence of chunk addresses that together
//! reconstruct a directory's byte content. Descriptors are signed with the
//! node identity over their canonical JSON form: stable field order, no
//! insignificant whitespace, `parent` omitted when empty, `signature`
//! omitted from the signed bytes.

pub mod builder;
pub mod repository;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{identity, ChunkHash, Identity};

pub use builder::SnapshotBuilder;
pub use repository::SnapshotRepository;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot signature invalid")]
    InvalidSignature,
}

/// Signed snapshot descriptor
///
/// Field order is the canonical wire order; do not reorder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    /// RFC 3339 UTC creation time
    pub timestamp: String,
    /// Ordered chunk addresses; restoration concatenates in this order
    pub chunks: Vec<ChunkHash>,
    pub meta: BTreeMap<String, String>,
    /// Base64 Ed25519 public key of the signer
    pub signer_pub: String,
    /// Base64 Ed25519 signature over the canonical form without this field
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a time-ordered snapshot id, unique within the process.
pub fn generate_snapshot_id() -> String {
    let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("snap-{:013}-{:04}", Utc::now().timestamp_millis(), seq)
}

impl Snapshot {
    pub fn new(
        parent: String,
        chunks: Vec<ChunkHash>,
        meta: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: generate_snapshot_id(),
            parent,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            chunks,
            meta,
            signer_pub: String::new(),
            signature: String::new(),
        }
    }

    /// Canonical bytes the signature covers: the descriptor with the
    /// signature field cleared.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign the descriptor, filling `signer_pub` and `signature`.
    pub fn sign(&mut self, identity: &Identity) -> Result<(), SnapshotError> {
        self.signer_pub = identity.public_base64();
        let payload = self.canonical_bytes()?;
        self.signature = BASE64.encode(identity.sign(&payload));
        Ok(())
    }

    /// Verify the descriptor signature against its embedded public key.
    pub fn verify_signature(&self) -> bool {
        let Ok(payload) = self.canonical_bytes() else {
            return false;
        };
        let Ok(signature) = BASE64.decode(&self.signature) else {
            return false;
        };
        if signature.len() != identity::SIGNATURE_LEN {
            return false;
        }
        identity::verify_base64(&payload, &signature, &self.signer_pub)
    }
}
