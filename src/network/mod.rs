//! Gossip transport layer
//!
//! The sync engine depends on two capabilities only: publishing bytes to
//! the backup topic and subscribing to the stream of inbound messages.
//! Production uses libp2p gossipsub; tests use an in-process hub that
//! delivers messages between nodes without sockets.

pub mod gossip;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use gossip::{GossipNode, GossipNodeConfig};

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("dial error: {0}")]
    Dial(String),
}

/// A message received from the gossip topic
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Peer id of the sender, as reported by the transport
    pub from: String,
    pub data: Vec<u8>,
}

/// Broadcast capability over the backup topic
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Publish bytes to every subscribed peer.
    async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError>;

    /// Open a stream of inbound messages from other peers.
    async fn subscribe(&self) -> Result<mpsc::Receiver<GossipMessage>, GossipError>;
}

/// In-process gossip hub for tests
///
/// Every node joined to the hub receives messages published by every
/// other node, but not its own.
pub struct MemoryHub {
    tx: broadcast::Sender<GossipMessage>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn join(&self, peer_id: impl Into<String>) -> MemoryGossip {
        MemoryGossip {
            peer_id: peer_id.into(),
            tx: self.tx.clone(),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's handle on a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryGossip {
    peer_id: String,
    tx: broadcast::Sender<GossipMessage>,
}

#[async_trait]
impl Gossip for MemoryGossip {
    async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError> {
        // No receivers just means no peers are listening yet
        let _ = self.tx.send(GossipMessage {
            from: self.peer_id.clone(),
            data,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<GossipMessage>, GossipError> {
        let mut hub_rx = self.tx.subscribe();
        let own_id = self.peer_id.clone();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match hub_rx.recv().await {
                    Ok(msg) if msg.from != own_id => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_to_other_nodes() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");

        let mut b_rx = b.subscribe().await.unwrap();
        a.publish(b"hello".to_vec()).await.unwrap();

        let msg = b_rx.recv().await.unwrap();
        assert_eq!(msg.from, "a");
        assert_eq!(msg.data, b"hello");
    }

    #[tokio::test]
    async fn test_hub_does_not_echo_to_sender() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");

        let mut a_rx = a.subscribe().await.unwrap();
        a.publish(b"own message".to_vec()).await.unwrap();
        b.publish(b"peer message".to_vec()).await.unwrap();

        // The first (and only) delivery to `a` is b's message
        let msg = a_rx.recv().await.unwrap();
        assert_eq!(msg.from, "b");
        assert_eq!(msg.data, b"peer message");
    }
}
