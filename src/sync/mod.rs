//! Peer-to-peer snapshot synchronization
//!
//! Outbound chunk fetching with bounded concurrency and inbound handling
//! of announcements, requests and responses.

pub mod engine;
pub mod fetcher;

pub use engine::{PeerRecord, SyncEngine, SyncError};
pub use fetcher::{ChunkFetcher, FetchError};
