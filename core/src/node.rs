/// Main node implementation
use crate::config::{NatMode, NodeConfig};
use crate::error::{BenchError, Result};
use crate::harness::gate::Connectivity;
use crate::identity::{self, NodeId, NodeIdentity, PeerUrl};
use crate::p2p::peer::{Direction, PeerEvent, PeerHandle, PeerManager};
use crate::p2p::protocol::{read_message, write_message, Message};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Missed pings before a silent peer is dropped
const MAX_IDLE_ROUNDS: u32 = 3;

/// Grace period for tasks to wind down on stop
const STOP_GRACE: Duration = Duration::from_secs(5);

/// What a service gets to see of the node it runs on
#[derive(Clone)]
pub struct ServiceContext {
    pub node_id: NodeId,
    pub peers: PeerManager,
    shutdown: watch::Receiver<bool>,
}

impl ServiceContext {
    /// Resolves once the node starts shutting down
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A protocol handler embedded in a node.
///
/// Services are registered before the node starts. Every inbound message
/// that is not part of the link layer is offered to each service in
/// registration order until one reports it handled.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, ctx: ServiceContext) -> Result<()>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Called after a peer completed its handshake and was registered
    async fn peer_connected(&self, _peer: &PeerHandle) -> Result<()> {
        Ok(())
    }

    /// Returns `true` if the message was consumed
    async fn handle_message(&self, peer: &PeerHandle, message: &Message) -> Result<bool>;
}

/// Main P2P node
pub struct Node {
    /// Unique node identifier
    pub id: NodeId,

    /// Node configuration
    config: NodeConfig,

    /// Identity key pair
    identity: NodeIdentity,

    /// Peer manager
    peer_manager: PeerManager,

    /// Registered services
    services: Arc<RwLock<Vec<Arc<dyn Service>>>>,

    /// Bound listener address once started
    local_addr: Arc<Mutex<Option<SocketAddr>>>,

    /// Wakes the connector when a peer is added
    dial_now: Arc<Notify>,

    /// Shutdown signal
    shutdown: Arc<watch::Sender<bool>>,

    /// Background tasks owned by the node
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,

    started: Arc<AtomicBool>,
}

impl Node {
    /// Create a new node with a generated (or, with a data dir, persisted) key
    pub fn new(config: NodeConfig) -> Result<Self> {
        let identity = match &config.data_dir {
            Some(dir) => identity::load_or_create(dir)?,
            None => NodeIdentity::generate()?,
        };
        let id = identity.node_id.clone();
        let peer_manager = PeerManager::new(id.clone(), config.max_peers);
        let (shutdown, _) = watch::channel(false);

        info!("Created new node with ID: {}", id);

        Ok(Self {
            id,
            config,
            identity,
            peer_manager,
            services: Arc::new(RwLock::new(Vec::new())),
            local_addr: Arc::new(Mutex::new(None)),
            dial_now: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a service; only allowed before `start`
    pub async fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(BenchError::Config(format!(
                "Cannot register service {} on a running node",
                service.name()
            )));
        }
        debug!("Registered service {}", service.name());
        self.services.write().await.push(service);
        Ok(())
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peer_manager
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    /// URL other nodes use to reach us, available once started
    pub fn peer_url(&self) -> Option<PeerUrl> {
        let bound = self.local_addr()?;
        let ip = match self.config.nat {
            NatMode::ExtIp(ip) => ip,
            NatMode::Any | NatMode::None if bound.ip().is_unspecified() => {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
            NatMode::Any | NatMode::None => bound.ip(),
        };
        Some(PeerUrl::new(self.id.clone(), SocketAddr::new(ip, bound.port())))
    }

    /// Add a static peer and dial it as soon as possible
    pub async fn add_peer(&self, url: &PeerUrl) {
        info!("Adding peer {}", url);
        self.peer_manager.add_static_peer(url.clone()).await;
        self.dial_now.notify_one();
    }

    /// Start the node: bind, start services, spawn background tasks.
    ///
    /// The returned guard stops the node when dropped.
    pub async fn start(&self) -> Result<RunningNode> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BenchError::Config("Node already started".to_string()));
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound = listener.local_addr()?;
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(bound);
        }

        info!("Starting node {}", self.id);
        info!("Listening on: {}", bound);

        let ctx = ServiceContext {
            node_id: self.id.clone(),
            peers: self.peer_manager.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let services = self.services.read().await.clone();
        for service in &services {
            if let Err(e) = service.start(ctx.clone()).await {
                error!("Service {} failed to start: {}", service.name(), e);
                self.shutdown.send_replace(true);
                return Err(e);
            }
            debug!("Service {} started", service.name());
        }

        let listener_handle = {
            let node = self.clone();
            tokio::spawn(async move { node.run_listener(listener).await })
        };

        let connector_handle = {
            let node = self.clone();
            tokio::spawn(async move { node.run_connector().await })
        };

        let heartbeat_handle = {
            let node = self.clone();
            tokio::spawn(async move { node.run_heartbeat().await })
        };

        self.track(listener_handle);
        self.track(connector_handle);
        self.track(heartbeat_handle);

        Ok(RunningNode {
            node: self.clone(),
            stopped: false,
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Graceful stop: close peers, let writers flush, stop services
    async fn shutdown(&self) -> Result<()> {
        info!("Stopping node {}", self.id);
        self.shutdown.send_replace(true);
        self.peer_manager.disconnect_all("node stopping").await;

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Task did not stop within {:?}, aborting", STOP_GRACE);
                abort.abort();
            }
        }

        let mut first_err = None;
        for service in self.services.read().await.iter() {
            if let Err(e) = service.stop().await {
                error!("Service {} failed to stop: {}", service.name(), e);
                first_err.get_or_insert(e);
            }
        }

        info!("Node stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Hard stop used when a running node is dropped without `stop`
    fn abort(&self) {
        self.shutdown.send_replace(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Run listener for incoming connections
    async fn run_listener(&self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let node = self.clone();
                            let handle = tokio::spawn(async move {
                                if let Err(e) = node.handle_incoming_connection(stream, addr).await {
                                    warn!("Incoming connection from {} failed: {}", addr, e);
                                }
                            });
                            self.track(handle);
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!("Listener stopped");
    }

    /// Handle incoming connection
    async fn handle_incoming_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!("Incoming connection from {}", addr);
        let listen_port = self.local_addr().map(|a| a.port()).unwrap_or(0);
        let peer_id = self
            .peer_manager
            .perform_handshake(
                &mut stream,
                &self.identity,
                None,
                listen_port,
                self.config.handshake_timeout,
            )
            .await?;

        info!("Handshake successful with {} (ID: {})", addr, peer_id);
        self.handle_connection(stream, peer_id, addr, Direction::Inbound)
            .await
    }

    /// Run connector to dial static peers
    async fn run_connector(&self) {
        let mut retry_interval = interval(self.config.retry_interval);
        retry_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = retry_interval.tick() => {}
                _ = self.dial_now.notified() => {}
            }

            let candidates = self
                .peer_manager
                .take_dial_candidates(self.config.max_connection_attempts)
                .await;
            for url in candidates {
                let node = self.clone();
                let handle = tokio::spawn(async move { node.connect_to_peer(url).await });
                self.track(handle);
            }
        }
        debug!("Connector stopped");
    }

    /// Connect to a specific peer
    async fn connect_to_peer(&self, url: PeerUrl) {
        debug!("Dialing {}", url);
        let connected = match timeout(self.config.connection_timeout, TcpStream::connect(url.addr)).await {
            Ok(Ok(mut stream)) => {
                let listen_port = self.local_addr().map(|a| a.port()).unwrap_or(0);
                match self
                    .peer_manager
                    .perform_handshake(
                        &mut stream,
                        &self.identity,
                        Some(&url),
                        listen_port,
                        self.config.handshake_timeout,
                    )
                    .await
                {
                    Ok(peer_id) => {
                        info!("Connected to peer {}", url);
                        if let Err(e) = self
                            .handle_connection(stream, peer_id, url.addr, Direction::Outbound)
                            .await
                        {
                            warn!("Connection with {} ended: {}", url.id, e);
                        }
                        true
                    }
                    Err(e) => {
                        error!("Handshake failed with {}: {}", url.addr, e);
                        false
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", url.addr, e);
                false
            }
            Err(_) => {
                warn!("Connection timeout to {}", url.addr);
                false
            }
        };
        self.peer_manager.finish_dial(&url.id, connected).await;
    }

    /// Drive an established connection until either side closes it
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_id: NodeId,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close { .. });
                write_message(&mut writer, &message).await?;
                if closing {
                    break;
                }
            }
            writer.shutdown().await?;
            Ok::<(), BenchError>(())
        });

        let handle = PeerHandle::new(peer_id.clone(), addr, direction, tx);
        if let Err(e) = self.peer_manager.register(handle.clone()).await {
            let _ = handle.send(Message::Close {
                reason: e.to_string(),
            });
            drop(handle);
            let _ = timeout(STOP_GRACE, writer_task).await;
            return Err(e);
        }

        let services = self.services.read().await.clone();
        for service in &services {
            if let Err(e) = service.peer_connected(&handle).await {
                warn!("Service {} rejected peer {}: {}", service.name(), peer_id, e);
            }
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut idle_rounds = 0;
        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                read = timeout(self.config.idle_timeout, read_message(&mut reader)) => match read {
                    Err(_) => {
                        idle_rounds += 1;
                        if idle_rounds > MAX_IDLE_ROUNDS {
                            break Err(BenchError::Timeout(format!("Peer {} went silent", peer_id)));
                        }
                        let ping = Message::Ping {
                            timestamp: chrono::Utc::now().timestamp(),
                        };
                        if let Err(e) = handle.send(ping) {
                            break Err(e);
                        }
                    }
                    Ok(Ok(Some(message))) => {
                        idle_rounds = 0;
                        self.peer_manager.update_peer_last_seen(&peer_id).await;
                        if !self.dispatch(&services, &handle, message).await {
                            break Ok(());
                        }
                    }
                    Ok(Ok(None)) => {
                        debug!("Connection closed by peer: {}", peer_id);
                        break Ok(());
                    }
                    Ok(Err(e)) => break Err(e),
                },
            }
        };

        // Cleanup
        if self.peer_manager.remove(&peer_id).await {
            info!("Peer {} disconnected", peer_id);
        }
        drop(handle);
        match timeout(STOP_GRACE, writer_task).await {
            Ok(Ok(Err(e))) => debug!("Writer for {} ended with: {}", peer_id, e),
            Err(_) => warn!("Writer for {} did not finish in time", peer_id),
            _ => {}
        }

        result
    }

    /// Handle one inbound message; returns `false` when the connection should close
    async fn dispatch(&self, services: &[Arc<dyn Service>], peer: &PeerHandle, message: Message) -> bool {
        match &message {
            Message::Ping { timestamp } => {
                debug!("Received ping from {}", peer.node_id);
                let _ = peer.send(Message::Pong {
                    timestamp: *timestamp,
                });
                return true;
            }
            Message::Pong { .. } => {
                debug!("Received pong from {}", peer.node_id);
                return true;
            }
            Message::Close { reason } => {
                info!("Peer {} closed connection: {}", peer.node_id, reason);
                return false;
            }
            Message::Handshake { .. } | Message::HandshakeAck { .. } => {
                warn!("Unexpected {} from {}", message.message_type(), peer.node_id);
                return true;
            }
            _ => {}
        }

        for service in services {
            match service.handle_message(peer, &message).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Service {} failed on {} from {}: {}",
                        service.name(),
                        message.message_type(),
                        peer.node_id,
                        e
                    );
                    return true;
                }
            }
        }

        debug!("Unhandled message type from {}: {}", peer.node_id, message.message_type());
        true
    }

    /// Run heartbeat task
    async fn run_heartbeat(&self) {
        let mut interval = interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = interval.tick() => {}
            }

            let stats = self.peer_manager.peer_stats().await;
            info!(
                "Heartbeat - Connected: {}/{} peers",
                stats.len(),
                self.peer_manager.max_peers()
            );
            for peer in &stats {
                debug!(
                    "  {} ({:?}) up {:?}, idle {:?}",
                    peer.node_id, peer.direction, peer.connected_for, peer.idle
                );
            }
        }
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            config: self.config.clone(),
            identity: self.identity.clone(),
            peer_manager: self.peer_manager.clone(),
            services: self.services.clone(),
            local_addr: self.local_addr.clone(),
            dial_now: self.dial_now.clone(),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
            started: self.started.clone(),
        }
    }
}

#[async_trait]
impl Connectivity for Node {
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_manager.subscribe_events()
    }

    async fn add_peer(&self, url: &PeerUrl) -> Result<()> {
        Node::add_peer(self, url).await;
        Ok(())
    }
}

/// A started node. Call [`RunningNode::stop`] for a graceful stop; dropping
/// the guard instead signals shutdown and aborts the node's tasks.
pub struct RunningNode {
    node: Node,
    stopped: bool,
}

impl RunningNode {
    pub async fn stop(mut self) -> Result<()> {
        self.stopped = true;
        self.node.shutdown().await
    }
}

impl Deref for RunningNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        if !self.stopped {
            debug!("Running node {} dropped without stop", self.node.id);
            self.node.abort();
        }
    }
}
