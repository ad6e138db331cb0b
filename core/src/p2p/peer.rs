/// Peer management, connection handshake, and peer events
use crate::error::{BenchError, Result};
use crate::identity::{verify_node_id, NodeId, NodeIdentity, PeerUrl};
use crate::p2p::protocol::{read_message, write_message, Message, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;

/// Connectivity transition reported on the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEventKind {
    Added,
    Removed,
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEventKind::Added => f.write_str("add"),
            PeerEventKind::Removed => f.write_str("drop"),
        }
    }
}

/// A peer was added to or removed from a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub peer: NodeId,
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{kind: {}, peer: {}}}", self.kind, self.peer)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Handle to a connected peer: identity plus its outbound queue
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub direction: Direction,
    outbound: mpsc::UnboundedSender<Message>,
}

impl PeerHandle {
    pub fn new(
        node_id: NodeId,
        address: SocketAddr,
        direction: Direction,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            node_id,
            address,
            direction,
            outbound,
        }
    }

    /// Queue a message for this peer's writer task
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| BenchError::Connection(format!("Peer {} is disconnected", self.node_id)))
    }
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub handle: PeerHandle,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

impl PeerInfo {
    fn new(handle: PeerHandle) -> Self {
        let now = Instant::now();
        Self {
            handle,
            connected_at: now,
            last_seen: now,
        }
    }
}

/// Snapshot of one connection, logged by the heartbeat
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub node_id: NodeId,
    pub direction: Direction,
    pub connected_for: Duration,
    pub idle: Duration,
}

/// A peer added explicitly and redialed while disconnected
#[derive(Debug, Clone)]
pub struct StaticPeer {
    pub url: PeerUrl,
    pub connection_attempts: u32,
    pub dialing: bool,
}

/// Peer manager for tracking connected peers and emitting peer events
#[derive(Clone)]
pub struct PeerManager {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    static_peers: Arc<RwLock<HashMap<NodeId, StaticPeer>>>,
    events: broadcast::Sender<PeerEvent>,
    our_node_id: NodeId,
    max_peers: usize,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(our_node_id: NodeId, max_peers: usize) -> Self {
        // Room for one pending add and one drop per peer
        let (events, _) = broadcast::channel(max_peers.max(1) * 2);
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            static_peers: Arc::new(RwLock::new(HashMap::new())),
            events,
            our_node_id,
            max_peers,
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Subscribe to peer added/removed events
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Register a peer whose handshake completed; emits `Added`
    pub async fn register(&self, handle: PeerHandle) -> Result<()> {
        let node_id = handle.node_id.clone();
        {
            let mut peers = self.peers.write().await;
            if node_id == self.our_node_id {
                return Err(BenchError::Peer("Refusing connection to self".to_string()));
            }
            if peers.contains_key(&node_id) {
                return Err(BenchError::Peer(format!("Peer {} already connected", node_id)));
            }
            if peers.len() >= self.max_peers {
                return Err(BenchError::Peer(format!(
                    "Too many peers ({} of {})",
                    peers.len(),
                    self.max_peers
                )));
            }
            peers.insert(node_id.clone(), PeerInfo::new(handle));
        }

        // No subscribers is fine
        let _ = self.events.send(PeerEvent {
            kind: PeerEventKind::Added,
            peer: node_id,
        });
        Ok(())
    }

    /// Drop a connected peer; emits `Removed` if it was registered
    pub async fn remove(&self, node_id: &NodeId) -> bool {
        let removed = self.peers.write().await.remove(node_id).is_some();
        if removed {
            let _ = self.events.send(PeerEvent {
                kind: PeerEventKind::Removed,
                peer: node_id.clone(),
            });
        }
        removed
    }

    /// Whether a new connection would exceed the peer cap
    pub async fn is_full(&self) -> bool {
        self.peers.read().await.len() >= self.max_peers
    }

    /// Get the handle of a connected peer
    pub async fn get_peer(&self, node_id: &NodeId) -> Option<PeerHandle> {
        let peers = self.peers.read().await;
        peers.get(node_id).map(|p| p.handle.clone())
    }

    /// Get all connected peers
    pub async fn get_connected_peers(&self) -> Vec<PeerHandle> {
        let peers = self.peers.read().await;
        peers.values().map(|p| p.handle.clone()).collect()
    }

    /// Update peer last seen
    pub async fn update_peer_last_seen(&self, node_id: &NodeId) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Link age and silence of every connected peer
    pub async fn peer_stats(&self) -> Vec<PeerStats> {
        let peers = self.peers.read().await;
        peers
            .values()
            .map(|p| PeerStats {
                node_id: p.handle.node_id.clone(),
                direction: p.handle.direction,
                connected_for: p.connected_at.elapsed(),
                idle: p.last_seen.elapsed(),
            })
            .collect()
    }

    /// Ask every connected peer to close and forget them
    pub async fn disconnect_all(&self, reason: &str) {
        let drained: Vec<PeerInfo> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in drained {
            let _ = peer.handle.send(Message::Close {
                reason: reason.to_string(),
            });
            let _ = self.events.send(PeerEvent {
                kind: PeerEventKind::Removed,
                peer: peer.handle.node_id,
            });
        }
    }

    /// Remember a peer to dial and keep redialing
    pub async fn add_static_peer(&self, url: PeerUrl) {
        let mut statics = self.static_peers.write().await;
        statics
            .entry(url.id.clone())
            .and_modify(|p| {
                p.url = url.clone();
                p.connection_attempts = 0;
            })
            .or_insert(StaticPeer {
                url,
                connection_attempts: 0,
                dialing: false,
            });
    }

    /// Static peers that are neither connected nor being dialed and still
    /// have attempts left. Marks the returned peers as dialing.
    pub async fn take_dial_candidates(&self, max_attempts: u32) -> Vec<PeerUrl> {
        let connected: Vec<NodeId> = self.peers.read().await.keys().cloned().collect();
        let mut statics = self.static_peers.write().await;
        let mut out = Vec::new();
        for peer in statics.values_mut() {
            if peer.dialing || connected.contains(&peer.url.id) {
                continue;
            }
            if peer.connection_attempts >= max_attempts {
                continue;
            }
            peer.dialing = true;
            peer.connection_attempts += 1;
            out.push(peer.url.clone());
        }
        out
    }

    /// Mark a dial as finished (successfully or not)
    pub async fn finish_dial(&self, node_id: &NodeId, connected: bool) {
        let mut statics = self.static_peers.write().await;
        if let Some(peer) = statics.get_mut(node_id) {
            peer.dialing = false;
            if connected {
                peer.connection_attempts = 0;
            }
        }
    }

    /// Perform handshake with a peer.
    ///
    /// Both sides present their public key and the claimed node id must be
    /// derived from it. The dialing side passes the URL it dialed and gets an
    /// error if the remote identity differs. The accepting side answers with `close`
    /// instead of an ack when it is already at its peer cap.
    pub async fn perform_handshake(
        &self,
        stream: &mut TcpStream,
        identity: &NodeIdentity,
        dialed: Option<&PeerUrl>,
        listen_port: u16,
        handshake_timeout: Duration,
    ) -> Result<NodeId> {
        match dialed {
            None => {
                let handshake = timeout(handshake_timeout, read_message(stream))
                    .await
                    .map_err(|_| BenchError::Timeout("Handshake timeout".to_string()))??;

                let node_id = match handshake {
                    Some(Message::Handshake {
                        node_id,
                        public_key,
                        protocol_version,
                        ..
                    }) => {
                        check_version(protocol_version)?;
                        verify_node_id(&node_id, &public_key)?
                    }
                    Some(other) => {
                        return Err(BenchError::Protocol(format!(
                            "Expected handshake message, got {}",
                            other.message_type()
                        )))
                    }
                    None => {
                        return Err(BenchError::Connection(
                            "Connection closed during handshake".to_string(),
                        ))
                    }
                };

                if self.is_full().await {
                    write_message(
                        stream,
                        &Message::Close {
                            reason: "too many peers".to_string(),
                        },
                    )
                    .await?;
                    return Err(BenchError::Peer(format!(
                        "Rejected {}: peer limit {} reached",
                        node_id, self.max_peers
                    )));
                }

                let ack = Message::HandshakeAck {
                    node_id: self.our_node_id.to_string(),
                    public_key: identity.public_key_string()?,
                    protocol_version: PROTOCOL_VERSION,
                };
                write_message(stream, &ack).await?;

                Ok(node_id)
            }
            Some(url) => {
                let handshake = Message::Handshake {
                    node_id: self.our_node_id.to_string(),
                    public_key: identity.public_key_string()?,
                    protocol_version: PROTOCOL_VERSION,
                    listen_port,
                };
                write_message(stream, &handshake).await?;

                let ack = timeout(handshake_timeout, read_message(stream))
                    .await
                    .map_err(|_| BenchError::Timeout("Handshake ack timeout".to_string()))??;

                match ack {
                    Some(Message::HandshakeAck {
                        node_id,
                        public_key,
                        protocol_version,
                    }) => {
                        check_version(protocol_version)?;
                        let node_id = verify_node_id(&node_id, &public_key)?;
                        if node_id != url.id {
                            return Err(BenchError::Peer(format!(
                                "Dialed {} but {} answered",
                                url.id, node_id
                            )));
                        }
                        Ok(node_id)
                    }
                    Some(Message::Close { reason }) => Err(BenchError::Connection(format!(
                        "Peer {} refused connection: {}",
                        url.id, reason
                    ))),
                    Some(other) => Err(BenchError::Protocol(format!(
                        "Expected handshake ack, got {}",
                        other.message_type()
                    ))),
                    None => Err(BenchError::Connection(
                        "Connection closed during handshake".to_string(),
                    )),
                }
            }
        }
    }
}

fn check_version(protocol_version: u8) -> Result<()> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(BenchError::Protocol(format!(
            "Protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, protocol_version
        )));
    }
    Ok(())
}
