//! Inbound gossip handling and snapshot reconciliation
//!
//! The engine validates every inbound message before acting on it and
//! never fails on malformed traffic: a message that does not verify is
//! dropped with a warning and the loop continues. Chunk requests for
//! chunks we do not hold are dropped without a response.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::Identity;
use crate::network::{Gossip, GossipError, GossipMessage};
use crate::protocol::{
    ChunkRequest, ChunkResponse, Envelope, PeerAdd, PeerRemove, ProtocolError,
    SnapshotAnnouncement,
};
use crate::snapshot::{repository::RepositoryError, Snapshot, SnapshotRepository};
use crate::storage::{ChunkStore, Database, StorageError};
use crate::sync::fetcher::ChunkFetcher;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("publish failed: {0}")]
    Publish(#[from] GossipError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("not authorized")]
    NotAuthorized,
}

/// Record persisted in the `peers` tree for every known peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    pub added_at: String,
}

/// Serves chunk requests, ingests responses and announcements, and keeps
/// the peer table in sync with admin messages.
pub struct SyncEngine {
    db: Arc<Database>,
    store: Arc<ChunkStore>,
    snapshots: Arc<SnapshotRepository>,
    fetcher: Arc<ChunkFetcher>,
    gossip: Arc<dyn Gossip>,
    identity: Identity,
    /// Base64 public keys allowed to manage peers
    admins: HashSet<String>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        store: Arc<ChunkStore>,
        snapshots: Arc<SnapshotRepository>,
        fetcher: Arc<ChunkFetcher>,
        gossip: Arc<dyn Gossip>,
        identity: Identity,
        admins: HashSet<String>,
    ) -> Self {
        Self {
            db,
            store,
            snapshots,
            fetcher,
            gossip,
            identity,
            admins,
        }
    }

    /// Broadcast a snapshot descriptor to peers.
    pub async fn announce_snapshot(&self, snapshot: &Snapshot) -> Result<(), SyncError> {
        info!(snapshot_id = %snapshot.id, "broadcasting snapshot");
        let envelope = Envelope::SnapshotAnnouncement {
            announcement: SnapshotAnnouncement {
                snapshot: snapshot.clone(),
            },
        };
        self.gossip.publish(envelope.encode()?).await?;
        Ok(())
    }

    /// Decode and dispatch one inbound gossip message. Malformed or
    /// unverifiable traffic is logged and dropped.
    pub async fn handle_message(self: &Arc<Self>, msg: GossipMessage) {
        let envelope = match Envelope::decode(&msg.data) {
            Ok(env) => env,
            Err(err) => {
                warn!(from = %msg.from, %err, "dropping undecodable gossip message");
                return;
            }
        };

        let outcome = match envelope {
            Envelope::SnapshotAnnouncement { announcement } => {
                self.handle_announcement(announcement).await
            }
            Envelope::ChunkRequest { request } => self.handle_chunk_request(request).await,
            Envelope::ChunkResponse { response } => self.handle_chunk_response(response),
            Envelope::PeerAdd { peer_add } => self.handle_peer_add(peer_add),
            Envelope::PeerRemove { peer_remove } => self.handle_peer_remove(peer_remove),
        };

        if let Err(err) = outcome {
            warn!(from = %msg.from, %err, "failed to handle gossip message");
        }
    }

    /// Serve a chunk request if we hold the chunk. Requests for chunks we
    /// do not have are dropped without a response.
    async fn handle_chunk_request(&self, request: ChunkRequest) -> Result<(), SyncError> {
        request.validate()?;

        let raw = match self.store.get_raw(&request.hash) {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => {
                debug!(chunk = %request.hash, "requested chunk not held, staying silent");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let response = ChunkResponse::new(request.hash, &raw, &self.identity);
        let envelope = Envelope::ChunkResponse { response };
        self.gossip.publish(envelope.encode()?).await?;
        debug!(chunk = %request.hash, "chunk response sent");
        Ok(())
    }

    /// Ingest a chunk response: signature, then content admission via the
    /// store (which rejects bytes not matching the claimed address), then
    /// wake any fetch waiting on this chunk.
    fn handle_chunk_response(&self, response: ChunkResponse) -> Result<(), SyncError> {
        response.validate()?;
        let raw = response.decode_data()?;

        match self.store.put_raw(&response.hash, &raw) {
            Ok(()) => {}
            Err(StorageError::IntegrityMismatch { .. }) => {
                warn!(chunk = %response.hash, "chunk response content mismatch, dropped");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.fetcher.complete(&response.hash, raw);
        debug!(chunk = %response.hash, "chunk response stored");
        Ok(())
    }

    /// Persist an unknown announced snapshot and reconcile its chunks in
    /// the background. Re-announcements of known snapshots are no-ops.
    async fn handle_announcement(
        self: &Arc<Self>,
        announcement: SnapshotAnnouncement,
    ) -> Result<(), SyncError> {
        announcement.validate()?;
        let snapshot = announcement.snapshot;

        if self.snapshots.exists(&snapshot.id)? {
            debug!(snapshot_id = %snapshot.id, "snapshot already known, ignoring");
            return Ok(());
        }

        info!(
            snapshot_id = %snapshot.id,
            chunks = snapshot.chunks.len(),
            "storing announced snapshot"
        );
        self.snapshots.save(&snapshot)?;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.reconcile(&snapshot).await;
        });
        Ok(())
    }

    /// Fetch every chunk of `snapshot` that is missing locally. Failed
    /// fetches are logged; successfully stored chunks are kept.
    pub async fn reconcile(&self, snapshot: &Snapshot) {
        let mut missing = Vec::new();
        for hash in &snapshot.chunks {
            match self.store.exists(hash) {
                Ok(false) => missing.push(*hash),
                Ok(true) => {}
                Err(err) => {
                    warn!(chunk = %hash, %err, "existence check failed during reconcile");
                }
            }
        }
        if missing.is_empty() {
            return;
        }

        info!(
            snapshot_id = %snapshot.id,
            missing = missing.len(),
            "reconciling missing chunks"
        );
        let fetches = missing.into_iter().map(|hash| {
            let fetcher = Arc::clone(&self.fetcher);
            async move { (hash, fetcher.fetch(hash).await) }
        });
        let mut fetched = 0usize;
        for (hash, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(_) => fetched += 1,
                Err(err) => warn!(chunk = %hash, %err, "failed to fetch chunk"),
            }
        }
        info!(snapshot_id = %snapshot.id, fetched, "reconciliation finished");
    }

    fn require_admin(&self, signer_pub: &str) -> Result<(), SyncError> {
        if self.admins.contains(signer_pub) {
            Ok(())
        } else {
            Err(SyncError::NotAuthorized)
        }
    }

    fn handle_peer_add(&self, peer_add: PeerAdd) -> Result<(), SyncError> {
        peer_add.validate()?;
        self.require_admin(&peer_add.signer_pub)?;

        let record = PeerRecord {
            peer_id: peer_add.peer_id.clone(),
            addr: peer_add.addr.clone(),
            added_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.db.peers().insert(peer_add.peer_id.as_bytes(), value)?;
        info!(peer_id = %peer_add.peer_id, addr = %peer_add.addr, "peer added");
        Ok(())
    }

    fn handle_peer_remove(&self, peer_remove: PeerRemove) -> Result<(), SyncError> {
        peer_remove.validate()?;
        self.require_admin(&peer_remove.signer_pub)?;

        self.db.peers().remove(peer_remove.peer_id.as_bytes())?;
        info!(peer_id = %peer_remove.peer_id, "peer removed");
        Ok(())
    }

    /// All persisted peer records.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, SyncError> {
        let mut peers = Vec::new();
        for item in self.db.peers().iter() {
            let (_, value) = item?;
            match serde_json::from_slice::<PeerRecord>(&value) {
                Ok(record) => peers.push(record),
                Err(err) => warn!(%err, "skipping undecodable peer record"),
            }
        }
        Ok(peers)
    }
}
