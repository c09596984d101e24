//! Local persistence layer
//!
//! The repository database and the encrypted content-addressed chunk
//! store that lives in its `blocks` tree.

pub mod chunks;
pub mod db;

pub use chunks::{ChunkStore, StorageError};
pub use db::{Database, DatabaseError};
