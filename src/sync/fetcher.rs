//! Outbound chunk fetching
//!
//! A fetch publishes a signed request on the gossip topic and waits for a
//! matching response, a timeout, or shutdown. Outstanding fetches are
//! tracked in a pending map keyed by content address; a second fetch for
//! the same address while one is in flight shares the first one's
//! response channel instead of publishing again. A semaphore bounds how
//! many fetches run at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::{ChunkHash, Identity};
use crate::network::{Gossip, GossipError};
use crate::protocol::{ChunkRequest, Envelope, ProtocolError};
use crate::storage::{ChunkStore, StorageError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("chunk fetch timeout: {0}")]
    Timeout(ChunkHash),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("publish failed: {0}")]
    Publish(#[from] GossipError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Fetches missing chunks from peers with bounded concurrency
pub struct ChunkFetcher {
    store: Arc<ChunkStore>,
    identity: Identity,
    gossip: Arc<dyn Gossip>,
    local_peer_id: String,
    timeout: Duration,
    limiter: Arc<Semaphore>,
    pending: Mutex<HashMap<ChunkHash, broadcast::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl ChunkFetcher {
    pub fn new(
        store: Arc<ChunkStore>,
        identity: Identity,
        gossip: Arc<dyn Gossip>,
        local_peer_id: String,
        max_concurrent: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            identity,
            gossip,
            local_peer_id,
            timeout,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pending: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Fetch a chunk's raw bytes, from the local store if present,
    /// otherwise from peers.
    pub async fn fetch(&self, hash: ChunkHash) -> Result<Vec<u8>, FetchError> {
        if self.store.exists(&hash)? {
            debug!(chunk = %hash, "chunk found in local storage");
            return self.store.get_raw(&hash).map_err(FetchError::from);
        }

        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let _permit = tokio::select! {
            permit = self.limiter.acquire() => {
                // The semaphore is never closed while the fetcher lives
                permit.expect("fetch limiter closed")
            }
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        // Register interest before publishing so a fast response cannot
        // slip past us. The first waiter for a hash owns the request.
        let (mut rx, owner) = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(&hash) {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    pending.insert(hash, tx);
                    (rx, true)
                }
            }
        };

        if owner {
            let request = ChunkRequest::new(hash, self.local_peer_id.clone(), &self.identity);
            let published = match (Envelope::ChunkRequest { request }).encode() {
                Ok(bytes) => self.gossip.publish(bytes).await.map_err(FetchError::from),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = published {
                self.remove_pending(&hash);
                return Err(err);
            }
            debug!(chunk = %hash, "chunk request published");
        }

        let outcome = tokio::select! {
            received = rx.recv() => match received {
                Ok(bytes) => Ok(bytes),
                // The channel owner gave up; treat it like our own timeout
                Err(_) => Err(FetchError::Timeout(hash)),
            },
            _ = tokio::time::sleep(self.timeout) => Err(FetchError::Timeout(hash)),
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
        };

        if owner {
            self.remove_pending(&hash);
        }

        if let Err(FetchError::Timeout(_)) = &outcome {
            warn!(chunk = %hash, "chunk fetch timeout");
        }
        outcome
    }

    /// Deliver a stored chunk's bytes to any waiters. Responses for
    /// addresses nobody is waiting on are dropped silently.
    pub fn complete(&self, hash: &ChunkHash, raw: Vec<u8>) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = pending.get(hash) {
            let _ = tx.send(raw);
        }
    }

    /// Number of fetches currently awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove_pending(&self, hash: &ChunkHash) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(hash);
    }
}
