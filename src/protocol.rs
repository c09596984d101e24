//! Gossip protocol messages
//!
//! All messages travel as UTF-8 JSON envelopes with a stable field order
//! and no insignificant whitespace. Every message kind is authenticated:
//! the signature covers a canonical payload reconstructed from the other
//! fields, so a message whose payload cannot be rebuilt byte-identically
//! fails validation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{identity, ChunkHash, Identity};
use crate::snapshot::Snapshot;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    InvalidSignature,
}

/// Wire envelope carried on the gossip topic
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "snapshot_announcement")]
    SnapshotAnnouncement { announcement: SnapshotAnnouncement },
    #[serde(rename = "chunk_request")]
    ChunkRequest { request: ChunkRequest },
    #[serde(rename = "chunk_response")]
    ChunkResponse { response: ChunkResponse },
    #[serde(rename = "peer_add")]
    PeerAdd { peer_add: PeerAdd },
    #[serde(rename = "peer_remove")]
    PeerRemove { peer_remove: PeerRemove },
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Decode a base64 signature, enforcing the Ed25519 signature length.
fn decode_signature(signature: &str) -> Result<Vec<u8>, ProtocolError> {
    let raw = BASE64
        .decode(signature)
        .map_err(|e| ProtocolError::Malformed(format!("signature base64: {e}")))?;
    if raw.len() != identity::SIGNATURE_LEN {
        return Err(ProtocolError::Malformed(format!(
            "signature length {} is not {}",
            raw.len(),
            identity::SIGNATURE_LEN
        )));
    }
    Ok(raw)
}

fn check(payload: &[u8], signature: &str, signer_pub: &str) -> Result<(), ProtocolError> {
    let sig = decode_signature(signature)?;
    BASE64
        .decode(signer_pub)
        .map_err(|e| ProtocolError::Malformed(format!("signer_pub base64: {e}")))?;
    if identity::verify_base64(payload, &sig, signer_pub) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidSignature)
    }
}

/// Carries a signed snapshot descriptor; the descriptor's own signature
/// authenticates the announcement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotAnnouncement {
    pub snapshot: Snapshot,
}

impl SnapshotAnnouncement {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        decode_signature(&self.snapshot.signature)?;
        if self.snapshot.verify_signature() {
            Ok(())
        } else {
            Err(ProtocolError::InvalidSignature)
        }
    }
}

/// Asks peers for a chunk by content address. Signed by the requestor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub hash: ChunkHash,
    /// Peer id of the requesting node
    pub requestor: String,
    pub signer_pub: String,
    pub signature: String,
}

impl ChunkRequest {
    pub fn new(hash: ChunkHash, requestor: String, identity: &Identity) -> Self {
        let payload = format!("{}|{}", hash.to_hex(), requestor);
        Self {
            hash,
            requestor,
            signer_pub: identity.public_base64(),
            signature: BASE64.encode(identity.sign(payload.as_bytes())),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let payload = format!("{}|{}", self.hash.to_hex(), self.requestor);
        check(payload.as_bytes(), &self.signature, &self.signer_pub)
    }
}

/// Carries a requested chunk's raw encrypted bytes. Signed by the responder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub hash: ChunkHash,
    /// Base64 of the raw stored bytes, `nonce || ciphertext || tag`
    pub data: String,
    pub signer_pub: String,
    pub signature: String,
}

impl ChunkResponse {
    pub fn new(hash: ChunkHash, raw: &[u8], identity: &Identity) -> Self {
        let data = BASE64.encode(raw);
        let payload = format!("{}|{}", hash.to_hex(), data);
        Self {
            hash,
            data,
            signer_pub: identity.public_base64(),
            signature: BASE64.encode(identity.sign(payload.as_bytes())),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let payload = format!("{}|{}", self.hash.to_hex(), self.data);
        check(payload.as_bytes(), &self.signature, &self.signer_pub)
    }

    /// Decode the carried raw bytes.
    pub fn decode_data(&self) -> Result<Vec<u8>, ProtocolError> {
        BASE64
            .decode(&self.data)
            .map_err(|e| ProtocolError::Malformed(format!("data base64: {e}")))
    }
}

/// Introduces a peer. Admin-signed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerAdd {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    pub peer_id: String,
    pub signer_pub: String,
    pub signature: String,
}

impl PeerAdd {
    pub fn new(addr: String, peer_id: String, identity: &Identity) -> Self {
        let payload = format!("{}|{}", addr, peer_id);
        Self {
            addr,
            peer_id,
            signer_pub: identity.public_base64(),
            signature: BASE64.encode(identity.sign(payload.as_bytes())),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let payload = format!("{}|{}", self.addr, self.peer_id);
        check(payload.as_bytes(), &self.signature, &self.signer_pub)
    }
}

/// Signals removal of a peer. Admin-signed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRemove {
    pub peer_id: String,
    pub signer_pub: String,
    pub signature: String,
}

impl PeerRemove {
    pub fn new(peer_id: String, identity: &Identity) -> Self {
        Self {
            signer_pub: identity.public_base64(),
            signature: BASE64.encode(identity.sign(peer_id.as_bytes())),
            peer_id,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        check(self.peer_id.as_bytes(), &self.signature, &self.signer_pub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_chunk_request_roundtrip() {
        let id = Identity::generate();
        let req = ChunkRequest::new(
            ChunkHash::from_plaintext(b"wanted"),
            "peer-1".to_string(),
            &id,
        );
        assert!(req.validate().is_ok());

        let bytes = Envelope::ChunkRequest { request: req }.encode().unwrap();
        let Envelope::ChunkRequest { request } = Envelope::decode(&bytes).unwrap() else {
            panic!("wrong envelope kind");
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_chunk_request_tamper_detected() {
        let id = Identity::generate();
        let mut req = ChunkRequest::new(
            ChunkHash::from_plaintext(b"wanted"),
            "peer-1".to_string(),
            &id,
        );
        req.requestor = "peer-2".to_string();
        assert!(matches!(
            req.validate(),
            Err(ProtocolError::InvalidSignature)
        ));
    }

    #[test]
    fn test_chunk_response_binds_hash_and_data() {
        let id = Identity::generate();
        let hash = ChunkHash::from_plaintext(b"plain");
        let resp = ChunkResponse::new(hash, b"raw encrypted bytes", &id);
        assert!(resp.validate().is_ok());
        assert_eq!(resp.decode_data().unwrap(), b"raw encrypted bytes");

        let mut forged = resp.clone();
        forged.data = BASE64.encode(b"other bytes");
        assert!(matches!(
            forged.validate(),
            Err(ProtocolError::InvalidSignature)
        ));
    }

    #[test]
    fn test_bad_signature_length_is_malformed() {
        let id = Identity::generate();
        let mut req =
            ChunkRequest::new(ChunkHash::from_plaintext(b"x"), "peer".to_string(), &id);
        req.signature = BASE64.encode([0u8; 32]);
        assert!(matches!(req.validate(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_bad_signer_pub_is_malformed() {
        let id = Identity::generate();
        let mut req =
            ChunkRequest::new(ChunkHash::from_plaintext(b"x"), "peer".to_string(), &id);
        req.signer_pub = "%%% not base64".to_string();
        assert!(matches!(req.validate(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_announcement_validates_descriptor_signature() {
        let id = Identity::generate();
        let mut snap = Snapshot::new(String::new(), vec![], BTreeMap::new());
        snap.sign(&id).unwrap();
        let ann = SnapshotAnnouncement { snapshot: snap };
        assert!(ann.validate().is_ok());

        let mut forged = ann.clone();
        forged.snapshot.id.push('x');
        assert!(forged.validate().is_err());
    }

    #[test]
    fn test_peer_messages_roundtrip() {
        let admin = Identity::generate();
        let add = PeerAdd::new("/ip4/1.2.3.4/tcp/4001".to_string(), "peer-9".to_string(), &admin);
        assert!(add.validate().is_ok());
        let remove = PeerRemove::new("peer-9".to_string(), &admin);
        assert!(remove.validate().is_ok());

        let mut forged = remove.clone();
        forged.peer_id = "peer-8".to_string();
        assert!(forged.validate().is_err());
    }

    #[test]
    fn test_envelope_wire_format() {
        let id = Identity::generate();
        let req = ChunkRequest::new(ChunkHash::from_plaintext(b"x"), "p".to_string(), &id);
        let bytes = Envelope::ChunkRequest { request: req }.encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\"type\":\"chunk_request\",\"request\":{\"hash\":"));
    }

    #[test]
    fn test_garbage_envelope_rejected() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(b"{\"type\":\"unknown_kind\"}").is_err());
    }
}
