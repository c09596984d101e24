//! Master key derivation and per-repository salt management using Argon2id
//!
//! Security: the master key is derived from the user passphrase with
//! Argon2id, which is resistant to GPU/ASIC attacks and side-channel
//! attacks. The salt is generated once per repository and persisted next
//! to the database so the same passphrase always yields the same key.

use std::fs;
use std::io::Write;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// File inside the repository holding the per-repository salt.
const SALT_FILE_NAME: &str = "salt.bin";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key derivation failed: {0}")]
    Derivation(argon2::Error),
    #[error("salt file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("salt file is malformed")]
    MalformedSalt,
}

/// Master encryption key derived from the user passphrase
/// Automatically zeroed when dropped
#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    /// Derive a master key from a passphrase and salt
    pub fn derive_from_passphrase(
        passphrase: &str,
        salt: &[u8; SALT_LEN],
    ) -> Result<Self, KeyError> {
        // Argon2id: 64 MiB memory, 1 iteration, 4 parallel lanes, 32-byte output
        let params = Params::new(64 * 1024, 1, 4, Some(32)).map_err(KeyError::Derivation)?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(KeyError::Derivation)?;

        Ok(Self { key })
    }

    /// Derive the repository master key, creating and persisting the salt
    /// on first use.
    pub fn for_repository(passphrase: &str, repo_path: &Path) -> Result<Self, KeyError> {
        let salt = load_or_create_salt(repo_path)?;
        Self::derive_from_passphrase(passphrase, &salt)
    }

    /// Construct from raw key material (test fixtures, external key managers)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Generate a new random salt for key derivation
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Read the repository salt, creating it with a fresh random value (and
/// mode 0600) if the file does not exist yet.
fn load_or_create_salt(repo_path: &Path) -> Result<[u8; SALT_LEN], KeyError> {
    fs::create_dir_all(repo_path)?;
    let salt_path = repo_path.join(SALT_FILE_NAME);

    if salt_path.exists() {
        let raw = fs::read(&salt_path)?;
        let salt: [u8; SALT_LEN] = raw.try_into().map_err(|_| KeyError::MalformedSalt)?;
        return Ok(salt);
    }

    let salt = generate_salt();
    let mut open = fs::OpenOptions::new();
    open.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open.mode(0o600);
    }
    let mut file = open.open(&salt_path)?;
    file.write_all(&salt)?;
    Ok(salt)
}
