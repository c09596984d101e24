//! Agent orchestrator
//!
//! Wires the repository, chunk store, snapshot builder, sync engine,
//! garbage collector and verifier together, owns the root cancellation
//! token, and exposes the operations the CLI drives. Background tasks
//! (inbound gossip loop, GC ticker) run until the token fires; shutdown
//! waits for them before closing the database.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compression::Compression;
use crate::config::Config;
use crate::crypto::{Identity, IdentityError, KeyError, MasterKey};
use crate::gc::{Collector, GcError, GcStats};
use crate::network::{Gossip, GossipError};
use crate::protocol::{Envelope, PeerAdd, PeerRemove};
use crate::snapshot::{
    builder::{BuildError, ChunkingParams},
    repository::RepositoryError,
    Snapshot, SnapshotBuilder, SnapshotRepository,
};
use crate::storage::{ChunkStore, Database, DatabaseError, StorageError};
use crate::sync::{ChunkFetcher, FetchError, PeerRecord, SyncEngine, SyncError};
use crate::verify::{VerificationResult, Verifier, VerifyError};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("snapshot build failed: {0}")]
    Build(#[from] BuildError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("verify error: {0}")]
    Verify(#[from] VerifyError),
    #[error("gc error: {0}")]
    Gc(#[from] GcError),
    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The backup agent: one repository, one identity, one gossip handle
pub struct Agent {
    config: Config,
    db: Arc<Database>,
    store: Arc<ChunkStore>,
    snapshots: Arc<SnapshotRepository>,
    builder: SnapshotBuilder,
    fetcher: Arc<ChunkFetcher>,
    engine: Arc<SyncEngine>,
    verifier: Verifier,
    collector: Arc<Collector>,
    identity: Identity,
    gossip: Arc<dyn Gossip>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Open (or initialize) the repository and wire all components.
    ///
    /// `local_peer_id` is the transport-level peer id used in chunk
    /// requests; the in-memory transport uses any unique string. `cancel`
    /// is the root token: background tasks and pending fetches observe it,
    /// and callers may derive the transport's token from it.
    pub fn new(
        config: Config,
        passphrase: &str,
        gossip: Arc<dyn Gossip>,
        local_peer_id: String,
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        let repo_path = config.repository_path.clone();
        fs::create_dir_all(&repo_path)?;

        let identity = Identity::load_or_create(&repo_path)?;
        let master_key = MasterKey::for_repository(passphrase, &repo_path)?;
        let db = Arc::new(Database::open(&repo_path)?);

        let compression = Compression::from_flag(config.snapshot.compression);
        let store = Arc::new(ChunkStore::new(db.clone(), master_key, compression));
        let snapshots = Arc::new(SnapshotRepository::new(db.clone()));

        let params = ChunkingParams {
            min: config.snapshot.min_chunk_size,
            max: config.snapshot.max_chunk_size,
            avg: config.snapshot.avg_chunk_size,
        };
        let builder = SnapshotBuilder::new(store.clone(), identity.clone(), params);

        let fetcher = Arc::new(ChunkFetcher::new(
            store.clone(),
            identity.clone(),
            gossip.clone(),
            local_peer_id,
            config.p2p.max_concurrent_fetch,
            config.chunk_fetch_timeout(),
            cancel.clone(),
        ));

        let admins: HashSet<String> = config.acl.admins.iter().cloned().collect();
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            store.clone(),
            snapshots.clone(),
            fetcher.clone(),
            gossip.clone(),
            identity.clone(),
            admins,
        ));

        let verifier = Verifier::new(snapshots.clone(), store.clone());
        let collector = Arc::new(Collector::new(
            db.clone(),
            config.storage.retention_days,
            config.gc_interval(),
        ));

        Ok(Self {
            config,
            db,
            store,
            snapshots,
            builder,
            fetcher,
            engine,
            verifier,
            collector,
            identity,
            gossip,
            cancel,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the inbound gossip loop and the GC ticker.
    pub async fn start_background_tasks(&self) -> Result<(), AgentError> {
        let mut rx = self.gossip.subscribe().await?;
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let inbound = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => engine.handle_message(msg).await,
                        None => break,
                    },
                }
            }
            info!("inbound gossip loop stopped");
        });

        let collector = self.collector.clone();
        let cancel = self.cancel.clone();
        let gc = tokio::spawn(async move {
            collector.run(cancel).await;
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(inbound);
        tasks.push(gc);
        Ok(())
    }

    /// Cancel background work, wait for it to wind down, flush the
    /// database. The repository handle stays usable for reads.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("agent shutting down");
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(%err, "background task panicked during shutdown");
            }
        }
        self.db.close()?;
        Ok(())
    }

    /// Build a snapshot of `path`, persist it, and announce it to peers.
    /// A failed announcement leaves the snapshot intact locally.
    pub async fn create_snapshot(&self, path: &Path) -> Result<Snapshot, AgentError> {
        let snapshot = self.builder.build(path, String::new())?;
        self.snapshots.save(&snapshot)?;
        info!(snapshot_id = %snapshot.id, chunks = snapshot.chunks.len(), "snapshot saved");

        if let Err(err) = self.engine.announce_snapshot(&snapshot).await {
            warn!(%err, "failed to broadcast snapshot, kept locally");
        }
        Ok(snapshot)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, AgentError> {
        Ok(self.snapshots.list()?)
    }

    pub fn load_snapshot(&self, id: &str) -> Result<Snapshot, AgentError> {
        Ok(self.snapshots.load(id)?)
    }

    /// Reassemble a snapshot's chunks, in order, into
    /// `<target>/restored_<id>.bin`.
    pub fn restore_snapshot(&self, id: &str, target: &Path) -> Result<PathBuf, AgentError> {
        let snapshot = self.snapshots.load(id)?;
        fs::create_dir_all(target)?;
        let output = target.join(format!("restored_{id}.bin"));
        let mut file = fs::File::create(&output)?;
        for hash in &snapshot.chunks {
            let plaintext = self.store.get_chunk(hash)?;
            file.write_all(&plaintext)?;
        }
        file.flush()?;
        info!(snapshot_id = %id, output = %output.display(), "snapshot restored");
        Ok(output)
    }

    pub fn run_gc_once(&self) -> Result<GcStats, AgentError> {
        Ok(self.collector.run_once()?)
    }

    pub fn verify_snapshot(&self, id: &str) -> Result<VerificationResult, AgentError> {
        Ok(self.verifier.verify(id)?)
    }

    /// Verify and pull missing chunks from peers.
    pub async fn repair_snapshot(&self, id: &str) -> Result<VerificationResult, AgentError> {
        let fetcher = self.fetcher.clone();
        let result = self
            .verifier
            .repair(id, move |hash| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch(hash).await }
            })
            .await?;
        Ok(result)
    }

    /// Announce a peer addition (admin-signed with our identity) and
    /// record it locally.
    pub async fn add_peer(&self, addr: &str, peer_id: &str) -> Result<(), AgentError> {
        let peer_add = PeerAdd::new(addr.to_string(), peer_id.to_string(), &self.identity);
        let envelope = Envelope::PeerAdd {
            peer_add: peer_add.clone(),
        };
        self.gossip
            .publish(envelope.encode().map_err(SyncError::from)?)
            .await?;

        let record = PeerRecord {
            peer_id: peer_id.to_string(),
            addr: addr.to_string(),
            added_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| SyncError::Protocol(crate::protocol::ProtocolError::Malformed(e.to_string())))?;
        self.db
            .peers()
            .insert(peer_id.as_bytes(), value)
            .map_err(|e| AgentError::Sync(SyncError::Database(e)))?;
        Ok(())
    }

    /// Announce a peer removal and delete the local record.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), AgentError> {
        let peer_remove = PeerRemove::new(peer_id.to_string(), &self.identity);
        let envelope = Envelope::PeerRemove { peer_remove };
        self.gossip
            .publish(envelope.encode().map_err(SyncError::from)?)
            .await?;
        self.db
            .peers()
            .remove(peer_id.as_bytes())
            .map_err(|e| AgentError::Sync(SyncError::Database(e)))?;
        Ok(())
    }

    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, AgentError> {
        Ok(self.engine.list_peers()?)
    }

    /// Fetch a single chunk from peers (used by repair flows).
    pub async fn fetch_chunk(
        &self,
        hash: crate::crypto::ChunkHash,
    ) -> Result<Vec<u8>, FetchError> {
        self.fetcher.fetch(hash).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryHub;
    use std::time::Duration;

    fn test_config(repo: &Path) -> Config {
        let mut config = Config::default();
        config.repository_path = repo.to_path_buf();
        config.p2p.chunk_fetch_timeout_secs = 1;
        config.storage.retention_days = 0;
        config.storage.gc_interval_secs = 3600;
        config
    }

    fn test_agent(hub: &MemoryHub, name: &str, repo: &Path) -> Arc<Agent> {
        let gossip = Arc::new(hub.join(name));
        Arc::new(
            Agent::new(
                test_config(repo),
                "passphrase",
                gossip,
                name.to_string(),
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_single_file_backup_and_restore() {
        let hub = MemoryHub::new();
        let repo = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join("greeting.txt"), b"Hello, ShadowVault!").unwrap();

        let agent = test_agent(&hub, "solo", repo.path());
        let snapshot = agent.create_snapshot(data.path()).await.unwrap();
        assert_eq!(snapshot.chunks.len(), 1);

        let listed = agent.list_snapshots().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snapshot.id);

        let target = tempfile::tempdir().unwrap();
        let output = agent.restore_snapshot(&snapshot.id, target.path()).unwrap();
        assert_eq!(
            output.file_name().unwrap().to_string_lossy(),
            format!("restored_{}.bin", snapshot.id)
        );
        assert_eq!(fs::read(&output).unwrap(), b"Hello, ShadowVault!");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds() {
        let hub = MemoryHub::new();
        let repo = tempfile::tempdir().unwrap();
        let agent = test_agent(&hub, "busy", repo.path());

        let mut dirs = Vec::new();
        for i in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            fs::write(
                dir.path().join("data.bin"),
                format!("unique file {i:02}").into_bytes(),
            )
            .unwrap();
            dirs.push(dir);
        }

        let mut handles = Vec::new();
        for dir in &dirs {
            let agent = agent.clone();
            let path = dir.path().to_path_buf();
            handles.push(tokio::spawn(
                async move { agent.create_snapshot(&path).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(agent.list_snapshots().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_verify_and_gc_via_agent() {
        let hub = MemoryHub::new();
        let repo = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join("file.bin"), vec![7u8; 10_000]).unwrap();

        let agent = test_agent(&hub, "ops", repo.path());
        let snapshot = agent.create_snapshot(data.path()).await.unwrap();

        let result = agent.verify_snapshot(&snapshot.id).unwrap();
        assert!(result.success);

        // GC with retention disabled keeps everything referenced
        let stats = agent.run_gc_once().unwrap();
        assert_eq!(stats.deleted_snapshots, 0);
        assert_eq!(stats.deleted_chunks, 0);
        assert!(agent.verify_snapshot(&snapshot.id).unwrap().success);
    }

    #[tokio::test]
    async fn test_repair_pulls_from_peer() {
        let hub = MemoryHub::new();
        let repo_a = tempfile::tempdir().unwrap();
        let repo_b = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join("file.bin"), b"shared across the vault").unwrap();

        let alice = test_agent(&hub, "alice", repo_a.path());
        // Same passphrase but a fresh repository salt would derive a
        // different key, so share the salt file within the trust group
        fs::copy(
            repo_a.path().join("salt.bin"),
            repo_b.path().join("salt.bin"),
        )
        .unwrap();
        let bob = test_agent(&hub, "bob", repo_b.path());

        alice.start_background_tasks().await.unwrap();
        bob.start_background_tasks().await.unwrap();

        // Bob backs up; the announcement replicates chunks to alice
        let snapshot = bob.create_snapshot(data.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Bob loses a chunk and repairs it from alice
        let lost = snapshot.chunks[0];
        bob.store.delete(&lost).unwrap();
        assert!(!bob.verify_snapshot(&snapshot.id).unwrap().success);

        let result = bob.repair_snapshot(&snapshot.id).await.unwrap();
        assert!(result.success);
        assert!(bob.store.exists(&lost).unwrap());

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let hub = MemoryHub::new();
        let repo = tempfile::tempdir().unwrap();
        let agent = test_agent(&hub, "quitter", repo.path());
        agent.start_background_tasks().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), agent.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
        assert!(agent.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_peerctl_roundtrip() {
        let hub = MemoryHub::new();
        let repo = tempfile::tempdir().unwrap();
        let agent = test_agent(&hub, "ctl", repo.path());

        agent
            .add_peer("/ip4/10.0.0.1/tcp/4001", "peer-xyz")
            .await
            .unwrap();
        let peers = agent.list_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "peer-xyz");
        assert_eq!(peers[0].addr, "/ip4/10.0.0.1/tcp/4001");

        agent.remove_peer("peer-xyz").await.unwrap();
        assert!(agent.list_peers().unwrap().is_empty());
    }
}
