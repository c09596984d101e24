//! Cryptography module for the backup agent
//!
//! Provides key derivation, authenticated encryption, content addressing,
//! and the persistent signing identity.

pub mod encryption;
pub mod hashing;
pub mod identity;
pub mod keys;

pub use encryption::{decrypt, encrypt, EncryptionError, NONCE_LEN, TAG_LEN};
pub use hashing::ChunkHash;
pub use identity::{Identity, IdentityError};
pub use keys::{KeyError, MasterKey, SALT_LEN};
