//! Repository database using the sled embedded engine
//!
//! Three named trees back the agent: `blocks` (encrypted chunks keyed by
//! content address), `snapshots` (signed descriptors keyed by id), and
//! `peers` (peer records keyed by peer id). All trees are created when the
//! repository opens. Individual tree operations commit atomically;
//! multi-step writers (chunk puts, snapshot save, GC) additionally
//! serialize on the repository write lock.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use sled::{Db, Tree};
use thiserror::Error;
use tracing::info;

pub const TREE_BLOCKS: &str = "blocks";
pub const TREE_SNAPSHOTS: &str = "snapshots";
pub const TREE_PEERS: &str = "peers";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("database error: {0}")]
    Sled(#[from] sled::Error),
}

/// Handle to the repository's embedded key-value store
pub struct Database {
    db: Db,
    blocks: Tree,
    snapshots: Tree,
    peers: Tree,
    write_lock: Mutex<()>,
}

impl Database {
    /// Open or create the database under `<repo>/metadata.db`
    pub fn open(repo_path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = repo_path.as_ref().join("metadata.db");
        let db = sled::open(&path)?;
        let blocks = db.open_tree(TREE_BLOCKS)?;
        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        let peers = db.open_tree(TREE_PEERS)?;

        info!(path = %path.display(), "repository database opened");

        Ok(Self {
            db,
            blocks,
            snapshots,
            peers,
            write_lock: Mutex::new(()),
        })
    }

    pub fn blocks(&self) -> &Tree {
        &self.blocks
    }

    pub fn snapshots(&self) -> &Tree {
        &self.snapshots
    }

    pub fn peers(&self) -> &Tree {
        &self.peers
    }

    /// Acquire the repository-wide writer lock. Readers proceed
    /// concurrently; mutating call sites hold this guard for the duration
    /// of their read-check-write sequence.
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flush all trees to disk and release the handle.
    pub fn close(&self) -> Result<(), DatabaseError> {
        self.db.flush()?;
        Ok(())
    }
}
