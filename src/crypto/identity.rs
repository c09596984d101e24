//! Persistent Ed25519 signing identity
//!
//! The identity keypair signs snapshot descriptors and protocol messages.
//! It is created lazily on first start and persisted in the repository as
//! the raw 64-byte keypair (seed || public), mode 0600. The public half is
//! shared with peers as base64.

use std::fs;
use std::io::Write;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

const KEY_FILE_NAME: &str = "identity.key";

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity key is malformed")]
    MalformedKey,
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("signature verification failed")]
    InvalidSignature,
}

/// The node's signing identity
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Load the identity from `<repo>/identity.key`, generating and
    /// persisting a fresh keypair if the file does not exist.
    pub fn load_or_create(repo_path: &Path) -> Result<Self, IdentityError> {
        fs::create_dir_all(repo_path)?;
        let key_path = repo_path.join(KEY_FILE_NAME);

        if key_path.exists() {
            let raw = fs::read(&key_path)?;
            let bytes: [u8; 64] = raw.try_into().map_err(|_| IdentityError::MalformedKey)?;
            let signing_key =
                SigningKey::from_keypair_bytes(&bytes).map_err(|_| IdentityError::MalformedKey)?;
            return Ok(Self { signing_key });
        }

        let signing_key = SigningKey::generate(&mut OsRng);

        let mut open = fs::OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600);
        }
        let mut file = open.open(&key_path)?;
        file.write_all(&signing_key.to_keypair_bytes())?;

        Ok(Self { signing_key })
    }

    /// Generate an ephemeral identity (test fixtures)
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Raw public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Base64 encoding of the public key, the form shared with peers
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public_bytes())
    }

    /// 32-byte seed, used to derive the libp2p transport identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Verify a signature against a base64-encoded public key.
///
/// Returns false for malformed keys or signatures rather than erroring;
/// callers in the protocol path treat any failure as an invalid message.
pub fn verify_base64(message: &[u8], signature: &[u8], pub_base64: &str) -> bool {
    let Ok(pub_raw) = BASE64.decode(pub_base64) else {
        return false;
    };
    let Ok(pub_bytes) = <[u8; 32]>::try_from(pub_raw.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pub_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}
