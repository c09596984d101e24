//! Snapshot construction
//!
//! Walks a directory tree depth-first, streams every regular file through
//! the content-defined chunker, stores each chunk in the CAS, and
//! assembles a signed descriptor over the resulting chunk sequence.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::chunker::{Chunker, ChunkerError};
use crate::crypto::{ChunkHash, Identity};
use crate::snapshot::{Snapshot, SnapshotError};
use crate::storage::{ChunkStore, StorageError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunker error: {0}")]
    Chunker(#[from] ChunkerError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Chunk size bounds for a build
#[derive(Debug, Clone, Copy)]
pub struct ChunkingParams {
    pub min: usize,
    pub max: usize,
    pub avg: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            min: 2048,
            max: 65536,
            avg: 8192,
        }
    }
}

/// Builds signed snapshots of directory trees
pub struct SnapshotBuilder {
    store: Arc<ChunkStore>,
    identity: Identity,
    params: ChunkingParams,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<ChunkStore>, identity: Identity, params: ChunkingParams) -> Self {
        Self {
            store,
            identity,
            params,
        }
    }

    /// Build and sign a snapshot of `root`.
    ///
    /// Errors abort the build; chunks already persisted stay in the store
    /// and are reclaimed by the next GC cycle if no snapshot references
    /// them.
    pub fn build(&self, root: &Path, parent: String) -> Result<Snapshot, BuildError> {
        info!(root = %root.display(), "building snapshot");
        let mut chunk_hashes: Vec<ChunkHash> = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            debug!(file = %entry.path().display(), "chunking file");
            self.chunk_file(entry.path(), &mut chunk_hashes)?;
        }

        let meta = BTreeMap::from([(
            "source".to_string(),
            root.to_string_lossy().into_owned(),
        )]);

        let mut snapshot = Snapshot::new(parent, chunk_hashes, meta);
        snapshot.sign(&self.identity)?;
        info!(
            snapshot_id = %snapshot.id,
            chunks = snapshot.chunks.len(),
            "snapshot built"
        );
        Ok(snapshot)
    }

    fn chunk_file(&self, path: &Path, out: &mut Vec<ChunkHash>) -> Result<(), BuildError> {
        let file = File::open(path)?;
        let chunker = Chunker::new(file, self.params.min, self.params.max, self.params.avg)?;
        for chunk in chunker {
            let chunk = chunk?;
            let hash = self.store.put_chunk(&chunk)?;
            out.push(hash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::crypto::MasterKey;
    use crate::storage::Database;
    use std::fs;

    fn builder_in(dir: &Path) -> SnapshotBuilder {
        let db = Arc::new(Database::open(dir).unwrap());
        let store = Arc::new(ChunkStore::new(
            db,
            MasterKey::from_bytes([5u8; 32]),
            Compression::None,
        ));
        SnapshotBuilder::new(store, Identity::generate(), ChunkingParams::default())
    }

    #[test]
    fn test_single_small_file_single_chunk() {
        let repo = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        fs::write(data_dir.path().join("hello.txt"), b"Hello, ShadowVault!").unwrap();

        let builder = builder_in(repo.path());
        let snap = builder.build(data_dir.path(), String::new()).unwrap();

        assert_eq!(snap.chunks.len(), 1);
        assert!(snap.verify_signature());
        assert_eq!(
            snap.meta.get("source").unwrap(),
            &data_dir.path().to_string_lossy().into_owned()
        );
        assert_eq!(
            builder.store.get_chunk(&snap.chunks[0]).unwrap(),
            b"Hello, ShadowVault!"
        );
    }

    #[test]
    fn test_identical_files_deduplicate() {
        let repo = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let body = b"abc".repeat(10_000);
        fs::write(data_dir.path().join("a.bin"), &body).unwrap();
        fs::write(data_dir.path().join("b.bin"), &body).unwrap();

        let builder = builder_in(repo.path());
        let snap = builder.build(data_dir.path(), String::new()).unwrap();

        let mut distinct: Vec<ChunkHash> = snap.chunks.clone();
        distinct.sort();
        distinct.dedup();
        // Both files contribute chunk references, one stored copy each
        assert_eq!(snap.chunks.len(), 2 * distinct.len());
        assert_eq!(builder.store.chunk_count(), distinct.len());
    }

    #[test]
    fn test_non_regular_entries_skipped() {
        let repo = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        fs::create_dir(data_dir.path().join("subdir")).unwrap();
        fs::write(data_dir.path().join("subdir/file.txt"), b"nested").unwrap();

        let builder = builder_in(repo.path());
        let snap = builder.build(data_dir.path(), String::new()).unwrap();
        assert_eq!(snap.chunks.len(), 1);
        assert_eq!(builder.store.get_chunk(&snap.chunks[0]).unwrap(), b"nested");
    }

    #[test]
    fn test_missing_root_fails() {
        let repo = tempfile::tempdir().unwrap();
        let builder = builder_in(repo.path());
        assert!(builder
            .build(Path::new("/nonexistent/shadowvault-test"), String::new())
            .is_err());
    }
}
