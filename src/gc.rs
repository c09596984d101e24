//! Garbage collection
//!
//! A cycle deletes snapshots older than the retention cutoff, computes
//! the set of chunk addresses still referenced by the remaining
//! snapshots, and reclaims every unreferenced block. The whole cycle runs
//! under the repository writer lock so a concurrent snapshot save is
//! either fully visible to the reference scan or not started yet; a chunk
//! is never deleted while any stored snapshot references it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::snapshot::Snapshot;
use crate::storage::Database;

#[derive(Error, Debug)]
pub enum GcError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

/// Result of one garbage collection cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub deleted_snapshots: usize,
    pub deleted_chunks: usize,
    pub bytes_freed: u64,
}

/// Periodic collector of expired snapshots and unreferenced chunks
pub struct Collector {
    db: Arc<Database>,
    /// Snapshots older than this many days are deleted; 0 retains forever
    retention_days: u32,
    interval: Duration,
}

impl Collector {
    pub fn new(db: Arc<Database>, retention_days: u32, interval: Duration) -> Self {
        Self {
            db,
            retention_days,
            interval,
        }
    }

    /// Run GC cycles on the configured interval until cancelled. A cycle
    /// in progress completes before shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            retention_days = self.retention_days,
            interval_secs = self.interval.as_secs(),
            "garbage collector started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_once() {
                        Ok(stats) => info!(
                            deleted_snapshots = stats.deleted_snapshots,
                            deleted_chunks = stats.deleted_chunks,
                            bytes_freed = stats.bytes_freed,
                            "garbage collection completed"
                        ),
                        Err(err) => warn!(%err, "garbage collection failed"),
                    }
                }
            }
        }
    }

    /// Perform a single collection cycle.
    pub fn run_once(&self) -> Result<GcStats, GcError> {
        let _guard = self.db.write_guard();
        let mut stats = GcStats::default();

        stats.deleted_snapshots = self.delete_expired_snapshots()?;

        let referenced = self.referenced_chunks()?;
        let (deleted_chunks, bytes_freed) = self.reclaim_unreferenced(&referenced)?;
        stats.deleted_chunks = deleted_chunks;
        stats.bytes_freed = bytes_freed;

        Ok(stats)
    }

    /// Delete snapshots whose timestamp is strictly before the retention
    /// cutoff. Snapshots with unparseable timestamps cannot be judged and
    /// stay in place.
    fn delete_expired_snapshots(&self) -> Result<usize, GcError> {
        if self.retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.retention_days));

        let mut expired = Vec::new();
        for item in self.db.snapshots().iter() {
            let (key, value) = item?;
            let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&value) else {
                warn!(
                    id = %String::from_utf8_lossy(&key),
                    "undecodable snapshot left in place"
                );
                continue;
            };
            match DateTime::parse_from_rfc3339(&snapshot.timestamp) {
                Ok(ts) if ts.with_timezone(&Utc) < cutoff => expired.push(snapshot.id),
                Ok(_) => {}
                Err(err) => {
                    warn!(id = %snapshot.id, %err, "unparseable snapshot timestamp, retained");
                }
            }
        }

        for id in &expired {
            self.db.snapshots().remove(id.as_bytes())?;
            info!(snapshot_id = %id, "deleted expired snapshot");
        }
        Ok(expired.len())
    }

    /// Union of chunk addresses named by every stored snapshot, as hex
    /// keys into the blocks tree.
    fn referenced_chunks(&self) -> Result<HashSet<String>, GcError> {
        let mut referenced = HashSet::new();
        for item in self.db.snapshots().iter() {
            let (_, value) = item?;
            let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&value) else {
                continue;
            };
            for hash in &snapshot.chunks {
                referenced.insert(hash.to_hex());
            }
        }
        Ok(referenced)
    }

    fn reclaim_unreferenced(
        &self,
        referenced: &HashSet<String>,
    ) -> Result<(usize, u64), GcError> {
        let mut deleted = 0usize;
        let mut bytes_freed = 0u64;
        for item in self.db.blocks().iter() {
            let (key, value) = item?;
            let key_text = String::from_utf8_lossy(&key);
            if referenced.contains(key_text.as_ref()) {
                continue;
            }
            self.db.blocks().remove(&key)?;
            deleted += 1;
            bytes_freed += value.len() as u64;
        }
        Ok((deleted, bytes_freed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::crypto::{ChunkHash, Identity, MasterKey};
    use crate::snapshot::SnapshotRepository;
    use crate::storage::ChunkStore;
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        store: Arc<ChunkStore>,
        repo: SnapshotRepository,
        identity: Identity,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let store = Arc::new(ChunkStore::new(
            db.clone(),
            MasterKey::from_bytes([3u8; 32]),
            Compression::None,
        ));
        let repo = SnapshotRepository::new(db.clone());
        Fixture {
            _dir: dir,
            db,
            store,
            repo,
            identity: Identity::generate(),
        }
    }

    fn snapshot_at(fx: &Fixture, timestamp: &str, chunks: Vec<ChunkHash>) -> Snapshot {
        let mut snap = Snapshot::new(String::new(), chunks, BTreeMap::new());
        snap.timestamp = timestamp.to_string();
        snap.sign(&fx.identity).unwrap();
        fx.repo.save(&snap).unwrap();
        snap
    }

    fn days_ago(days: i64) -> String {
        (Utc::now() - ChronoDuration::days(days)).to_rfc3339()
    }

    #[test]
    fn test_retention_zero_retains_everything() {
        let fx = fixture();
        for i in 0..3 {
            let hash = fx.store.put_chunk(format!("chunk {i}").as_bytes()).unwrap();
            snapshot_at(&fx, &days_ago(1000 + i), vec![hash]);
        }

        let collector = Collector::new(fx.db.clone(), 0, Duration::from_secs(3600));
        let stats = collector.run_once().unwrap();

        assert_eq!(stats.deleted_snapshots, 0);
        assert_eq!(stats.deleted_chunks, 0);
        assert_eq!(fx.repo.count(), 3);
        assert_eq!(fx.store.chunk_count(), 3);
    }

    #[test]
    fn test_expired_snapshots_and_their_chunks_reclaimed() {
        let fx = fixture();
        let old_hash = fx.store.put_chunk(b"only in the old snapshot").unwrap();
        let shared_hash = fx.store.put_chunk(b"shared between both").unwrap();
        let new_hash = fx.store.put_chunk(b"only in the new snapshot").unwrap();

        let old = snapshot_at(&fx, &days_ago(60), vec![old_hash, shared_hash]);
        let newer = snapshot_at(&fx, &days_ago(1), vec![shared_hash, new_hash]);

        let collector = Collector::new(fx.db.clone(), 30, Duration::from_secs(3600));
        let stats = collector.run_once().unwrap();

        assert_eq!(stats.deleted_snapshots, 1);
        assert!(!fx.repo.exists(&old.id).unwrap());
        assert!(fx.repo.exists(&newer.id).unwrap());

        // Only the chunk referenced solely by the old snapshot is gone
        assert!(!fx.store.exists(&old_hash).unwrap());
        assert!(fx.store.exists(&shared_hash).unwrap());
        assert!(fx.store.exists(&new_hash).unwrap());
        assert_eq!(stats.deleted_chunks, 1);
        assert!(stats.bytes_freed > 0);
    }

    #[test]
    fn test_unreferenced_chunks_reclaimed_without_retention() {
        let fx = fixture();
        let kept = fx.store.put_chunk(b"referenced").unwrap();
        let orphan = fx.store.put_chunk(b"orphaned by an aborted build").unwrap();
        snapshot_at(&fx, &days_ago(0), vec![kept]);

        let collector = Collector::new(fx.db.clone(), 0, Duration::from_secs(3600));
        let stats = collector.run_once().unwrap();

        assert_eq!(stats.deleted_chunks, 1);
        assert!(fx.store.exists(&kept).unwrap());
        assert!(!fx.store.exists(&orphan).unwrap());
    }

    #[test]
    fn test_all_referenced_chunks_survive_every_cycle() {
        let fx = fixture();
        let mut live = Vec::new();
        for i in 0..5 {
            let hash = fx.store.put_chunk(format!("live {i}").as_bytes()).unwrap();
            live.push(hash);
        }
        snapshot_at(&fx, &days_ago(2), live.clone());

        let collector = Collector::new(fx.db.clone(), 30, Duration::from_secs(3600));
        for _ in 0..3 {
            collector.run_once().unwrap();
            for hash in &live {
                assert!(fx.store.exists(hash).unwrap());
            }
        }
    }

    #[test]
    fn test_unparseable_timestamp_is_retained() {
        let fx = fixture();
        let hash = fx.store.put_chunk(b"guarded by a broken clock").unwrap();
        let snap = snapshot_at(&fx, "not a timestamp", vec![hash]);

        let collector = Collector::new(fx.db.clone(), 1, Duration::from_secs(3600));
        let stats = collector.run_once().unwrap();

        assert_eq!(stats.deleted_snapshots, 0);
        assert!(fx.repo.exists(&snap.id).unwrap());
        assert!(fx.store.exists(&hash).unwrap());
    }

    #[tokio::test]
    async fn test_run_loop_exits_on_cancel() {
        let fx = fixture();
        let collector = Collector::new(fx.db.clone(), 0, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("collector did not stop")
            .unwrap();
    }
}
