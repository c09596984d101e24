//! libp2p gossip node
//!
//! Runs a swarm combining gossipsub (the backup topic), Kademlia for peer
//! discovery, identify for address exchange, and ping for keepalive. The
//! swarm event loop runs as a background task owned by the agent's
//! cancellation token; the [`Gossip`] handle talks to it over channels.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad,
    multiaddr::Protocol,
    noise, ping,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Gossip, GossipError, GossipMessage};
use crate::crypto::Identity;

/// Gossip topic every backup agent joins.
pub const SYNC_TOPIC: &str = "backup-sync";

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/shadowvault/kad/1.0.0");
const IDENTIFY_PROTOCOL: &str = "/shadowvault/id/1.0.0";

/// Combined network behaviour for the backup agent
#[derive(NetworkBehaviour)]
pub struct AgentBehaviour {
    /// Gossipsub carries announcements, chunk requests and responses
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT for peer discovery
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping for connection keepalive
    pub ping: ping::Behaviour,
}

impl AgentBehaviour {
    fn new(
        local_peer_id: PeerId,
        keypair: &libp2p::identity::Keypair,
    ) -> Result<Self, GossipError> {
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| GossipError::Transport(e.to_string()))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| GossipError::Transport(e.to_string()))?;

        let mut kad_config = kad::Config::default();
        kad_config.set_protocol_names(vec![KAD_PROTOCOL]);
        kad_config.set_query_timeout(Duration::from_secs(60));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        Ok(Self {
            gossipsub,
            kademlia,
            identify,
            ping,
        })
    }
}

/// Gossip node configuration
#[derive(Clone, Debug)]
pub struct GossipNodeConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Multiaddrs of bootstrap peers
    pub bootstrap_peers: Vec<String>,
}

enum Command {
    Publish(Vec<u8>, oneshot::Sender<Result<(), GossipError>>),
}

/// Handle to the running libp2p gossip task
pub struct GossipNode {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    inbound_tx: broadcast::Sender<GossipMessage>,
}

impl GossipNode {
    /// Build the swarm and spawn its event loop. The loop exits when
    /// `cancel` fires.
    pub fn spawn(
        identity: &Identity,
        config: GossipNodeConfig,
        cancel: CancellationToken,
    ) -> Result<Self, GossipError> {
        let keypair = libp2p::identity::Keypair::ed25519_from_bytes(identity.seed())
            .map_err(|e| GossipError::Transport(e.to_string()))?;
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer_id = %local_peer_id, "gossip node starting");

        let behaviour = AgentBehaviour::new(local_peer_id, &keypair)?;
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| GossipError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(move |_| behaviour)
            .map_err(|e| GossipError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let topic = gossipsub::IdentTopic::new(SYNC_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| GossipError::Subscribe(e.to_string()))?;

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| GossipError::Transport(e.to_string()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| GossipError::Transport(e.to_string()))?;

        for addr in &config.bootstrap_peers {
            match addr.parse::<Multiaddr>() {
                Ok(maddr) => {
                    if let Some(Protocol::P2p(peer_id)) = maddr.iter().last() {
                        swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, maddr.clone());
                    }
                    if let Err(err) = swarm.dial(maddr.clone()) {
                        warn!(%addr, %err, "failed to dial bootstrap peer");
                    }
                }
                Err(err) => warn!(%addr, %err, "invalid bootstrap address"),
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (inbound_tx, _) = broadcast::channel(256);

        let node = Self {
            local_peer_id,
            cmd_tx,
            inbound_tx: inbound_tx.clone(),
        };

        tokio::spawn(run_swarm(swarm, topic, cmd_rx, inbound_tx, cancel));

        Ok(node)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

async fn run_swarm(
    mut swarm: Swarm<AgentBehaviour>,
    topic: gossipsub::IdentTopic,
    mut cmd_rx: mpsc::Receiver<Command>,
    inbound_tx: broadcast::Sender<GossipMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("gossip node shutting down");
                return;
            }
            Some(cmd) = cmd_rx.recv() => match cmd {
                Command::Publish(data, reply) => {
                    let result = swarm
                        .behaviour_mut()
                        .gossipsub
                        .publish(topic.clone(), data)
                        .map(|_| ())
                        .map_err(|e| GossipError::Publish(e.to_string()));
                    let _ = reply.send(result);
                }
            },
            event = swarm.select_next_some() => handle_swarm_event(&mut swarm, event, &inbound_tx),
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<AgentBehaviour>,
    event: SwarmEvent<AgentBehaviourEvent>,
    inbound_tx: &broadcast::Sender<GossipMessage>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            info!(%peer_id, "peer connected");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            info!(%peer_id, "peer disconnected");
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let _ = inbound_tx.send(GossipMessage {
                from: message
                    .source
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| propagation_source.to_string()),
                data: message.data,
            });
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            debug!(%peer_id, protocols = ?info.protocols, "identified peer");
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl Gossip for GossipNode {
    async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(data, reply_tx))
            .await
            .map_err(|_| GossipError::Transport("gossip task stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| GossipError::Transport("gossip task stopped".to_string()))?
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<GossipMessage>, GossipError> {
        let mut hub_rx = self.inbound_tx.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match hub_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "inbound gossip consumer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
