//! ShadowVault - Decentralized Encrypted Backup Agent
//!
//! Each node turns a directory tree into a signed, deduplicated, encrypted
//! snapshot, persists the encrypted content-addressed chunks in a local
//! repository, and cooperates with other nodes over a gossip network to
//! replicate and repair snapshots:
//! - Files are chunked with content-defined boundaries and deduplicated
//! - Chunks are encrypted client-side before they ever leave the machine
//! - Snapshot descriptors are signed with the node's Ed25519 identity
//! - Peers exchange announcements, chunk requests and chunk responses
//! - A garbage collector enforces retention and reclaims unreferenced chunks

pub mod agent;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod gc;
pub mod network;
pub mod protocol;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod verify;

// Re-export commonly used types
pub use agent::Agent;
pub use chunker::Chunker;
pub use config::Config;
pub use crypto::{ChunkHash, Identity, MasterKey};
pub use network::{Gossip, MemoryGossip};
pub use snapshot::Snapshot;
pub use storage::{ChunkStore, Database};
pub use sync::{ChunkFetcher, SyncEngine};
pub use verify::{VerificationResult, Verifier};
