//! Snapshot persistence over the `snapshots` tree
//!
//! Descriptors are stored as their canonical JSON so a load round-trips
//! byte-identically and signatures keep verifying.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::snapshot::Snapshot;
use crate::storage::Database;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("snapshot not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Load, save, list and delete snapshot descriptors
pub struct SnapshotRepository {
    db: Arc<Database>,
}

impl SnapshotRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), RepositoryError> {
        let data = serde_json::to_vec(snapshot)?;
        let _guard = self.db.write_guard();
        self.db.snapshots().insert(snapshot.id.as_bytes(), data)?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Snapshot, RepositoryError> {
        let value = self
            .db
            .snapshots()
            .get(id.as_bytes())?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// All stored snapshots. Undecodable entries are skipped with a
    /// warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<Snapshot>, RepositoryError> {
        let mut snapshots = Vec::new();
        for item in self.db.snapshots().iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<Snapshot>(&value) {
                Ok(snap) => snapshots.push(snap),
                Err(err) => {
                    warn!(
                        id = %String::from_utf8_lossy(&key),
                        %err,
                        "skipping undecodable snapshot entry"
                    );
                }
            }
        }
        Ok(snapshots)
    }

    pub fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let _guard = self.db.write_guard();
        self.db.snapshots().remove(id.as_bytes())?;
        Ok(())
    }

    pub fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.db.snapshots().contains_key(id.as_bytes())?)
    }

    pub fn count(&self) -> usize {
        self.db.snapshots().len()
    }
}
