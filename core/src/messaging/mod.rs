/// Envelope messaging service: keys, filters, envelope pool and gossip
pub mod envelope;
pub mod filter;

pub use envelope::{Envelope, EnvelopeHash, SymKey, Topic};
pub use filter::{Criteria, Filters, ReceivedMessage};

use crate::config::MessagingConfig;
use crate::error::{BenchError, Result};
use crate::harness::waiter::FilterSource;
use crate::identity::{NodeId, PeerUrl};
use crate::node::{Service, ServiceContext};
use crate::p2p::peer::PeerHandle;
use crate::p2p::protocol::Message;
use async_trait::async_trait;
use envelope::unix_now;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accepted clock drift for envelopes that claim to be sent in the future
const MAX_CLOCK_DRIFT_SECS: u64 = 30;

/// Hook for a mail server living next to the messaging service
#[async_trait]
pub trait MailServerHandler: Send + Sync {
    /// Store an envelope that just entered the pool
    async fn archive(&self, envelope: &Envelope) -> Result<()>;

    /// Serve a `messages_request` from `peer`
    async fn deliver_mail(&self, peer: &PeerHandle, request: &Envelope) -> Result<()>;
}

/// Parameters of [`MessagingService::post`]
#[derive(Debug, Clone)]
pub struct PostParams {
    pub sym_key_id: String,
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub ttl: u32,
}

type Pool = Arc<RwLock<HashMap<EnvelopeHash, Envelope>>>;

pub struct MessagingService {
    config: MessagingConfig,
    keys: RwLock<HashMap<String, SymKey>>,
    filters: RwLock<Filters>,
    pool: Pool,
    trusted: RwLock<HashSet<NodeId>>,
    mail_server: RwLock<Option<Arc<dyn MailServerHandler>>>,
    ctx: OnceLock<ServiceContext>,
}

impl MessagingService {
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            filters: RwLock::new(Filters::new()),
            pool: Arc::new(RwLock::new(HashMap::new())),
            trusted: RwLock::new(HashSet::new()),
            mail_server: RwLock::new(None),
            ctx: OnceLock::new(),
        }
    }

    /// Attach a mail server; it sees every new pooled envelope and all requests
    pub async fn register_mail_server(&self, handler: Arc<dyn MailServerHandler>) {
        *self.mail_server.write().await = Some(handler);
    }

    // Keys

    pub async fn add_sym_key(&self, key: SymKey) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.keys.write().await.insert(id.clone(), key);
        id
    }

    /// Derive a key from `password` and store it under a new id
    pub async fn add_sym_key_from_password(&self, password: &str) -> Result<String> {
        if password.is_empty() {
            return Err(BenchError::Crypto("Password must not be empty".to_string()));
        }
        Ok(self.add_sym_key(SymKey::from_password(password)).await)
    }

    pub async fn get_sym_key(&self, id: &str) -> Result<SymKey> {
        self.keys
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BenchError::Crypto(format!("No symmetric key with id {}", id)))
    }

    pub async fn has_sym_key(&self, id: &str) -> bool {
        self.keys.read().await.contains_key(id)
    }

    pub async fn delete_sym_key(&self, id: &str) -> bool {
        self.keys.write().await.remove(id).is_some()
    }

    // Filters

    pub async fn new_message_filter(&self, criteria: Criteria) -> Result<String> {
        let key = self.get_sym_key(&criteria.sym_key_id).await?;
        let mut filters = self.filters.write().await;
        let id = filters.install(key, &criteria)?;
        debug!(
            "Installed filter {} on {:?} ({} active)",
            id,
            criteria.topics,
            filters.len()
        );
        Ok(id)
    }

    pub async fn get_filter_messages(&self, id: &str) -> Result<Vec<ReceivedMessage>> {
        self.filters.write().await.drain(id)
    }

    pub async fn delete_message_filter(&self, id: &str) -> bool {
        self.filters.write().await.uninstall(id)
    }

    // Peers

    /// Accept point-to-point envelopes from this peer
    pub async fn mark_trusted_peer(&self, url: &PeerUrl) -> Result<bool> {
        self.trusted.write().await.insert(url.id.clone());
        debug!("Trusting p2p messages from {}", url.id);
        Ok(true)
    }

    pub async fn is_trusted(&self, node_id: &NodeId) -> bool {
        self.trusted.read().await.contains(node_id)
    }

    // Envelopes

    pub async fn pool_size(&self) -> usize {
        self.pool.read().await.len()
    }

    /// Seal a message, pool it and gossip it to every connected peer
    pub async fn post(&self, params: PostParams) -> Result<EnvelopeHash> {
        let ctx = self
            .ctx
            .get()
            .ok_or_else(|| BenchError::Config("Messaging service not started".to_string()))?;
        let key = self.get_sym_key(&params.sym_key_id).await?;
        let envelope = Envelope::seal(&key, params.topic, &params.payload, params.ttl, unix_now())?;
        let hash = envelope.hash();

        self.add_envelope(&envelope, None).await?;
        let message = Message::Envelopes {
            envelopes: vec![envelope],
        };
        for peer in ctx.peers.get_connected_peers().await {
            if let Err(e) = peer.send(message.clone()) {
                debug!("Could not queue envelope for {}: {}", peer.node_id, e);
            }
        }
        Ok(hash)
    }

    /// Validate and pool an envelope; returns `true` if it was new
    async fn add_envelope(&self, envelope: &Envelope, from: Option<&NodeId>) -> Result<bool> {
        if envelope.size() > self.config.max_message_size {
            return Err(BenchError::Protocol(format!(
                "Envelope of {} bytes exceeds limit of {}",
                envelope.size(),
                self.config.max_message_size
            )));
        }
        let now = unix_now();
        if envelope.is_expired(now) {
            debug!("Dropping expired envelope {}", envelope.hash());
            return Ok(false);
        }
        if envelope.sent() > now + MAX_CLOCK_DRIFT_SECS {
            return Err(BenchError::Protocol(format!(
                "Envelope {} sent in the future",
                envelope.hash()
            )));
        }

        let hash = envelope.hash();
        {
            let mut pool = self.pool.write().await;
            if pool.contains_key(&hash) {
                return Ok(false);
            }
            pool.insert(hash, envelope.clone());
        }

        if let Some(mail_server) = self.mail_server.read().await.as_ref() {
            if let Err(e) = mail_server.archive(envelope).await {
                warn!("Failed to archive envelope {}: {}", hash, e);
            }
        }

        self.filters.write().await.notify(envelope, false, from);
        Ok(true)
    }

    async fn handle_envelopes(&self, peer: &PeerHandle, envelopes: &[Envelope]) -> Result<()> {
        let mut fresh = Vec::new();
        let mut rejected = 0;
        for envelope in envelopes {
            match self.add_envelope(envelope, Some(&peer.node_id)).await {
                Ok(true) => fresh.push(envelope.clone()),
                Ok(false) => {}
                Err(e) => {
                    debug!("Skipping envelope from {}: {}", peer.node_id, e);
                    rejected += 1;
                }
            }
        }

        if !fresh.is_empty() {
            debug!("{} new envelopes from {}", fresh.len(), peer.node_id);
            if let Some(ctx) = self.ctx.get() {
                let relay = Message::Envelopes { envelopes: fresh };
                for other in ctx.peers.get_connected_peers().await {
                    if other.node_id != peer.node_id {
                        let _ = other.send(relay.clone());
                    }
                }
            }
        }

        if rejected > 0 {
            return Err(BenchError::Protocol(format!(
                "{} of {} envelopes from {} rejected",
                rejected,
                envelopes.len(),
                peer.node_id
            )));
        }
        Ok(())
    }

    async fn handle_p2p_envelopes(&self, peer: &PeerHandle, envelopes: &[Envelope]) -> Result<()> {
        if !self.is_trusted(&peer.node_id).await {
            return Err(BenchError::Peer(format!(
                "p2p envelopes from untrusted peer {}",
                peer.node_id
            )));
        }

        // Archived mail may be past its TTL and is still delivered
        let mut filters = self.filters.write().await;
        let mut delivered = 0;
        for envelope in envelopes {
            delivered += filters.notify(envelope, true, Some(&peer.node_id));
        }
        debug!(
            "{} p2p envelopes from {}, {} filter deliveries",
            envelopes.len(),
            peer.node_id,
            delivered
        );
        Ok(())
    }

    async fn live_envelopes(&self) -> Vec<Envelope> {
        let now = unix_now();
        self.pool
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect()
    }
}

/// Drop expired envelopes until the node stops
async fn expire_loop(pool: Pool, ctx: ServiceContext, every: std::time::Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ctx.stopped() => break,
            _ = ticker.tick() => {}
        }
        let now = unix_now();
        let mut pool = pool.write().await;
        let before = pool.len();
        pool.retain(|_, e| !e.is_expired(now));
        let removed = before - pool.len();
        if removed > 0 {
            debug!("Expired {} envelopes", removed);
        }
    }
}

#[async_trait]
impl Service for MessagingService {
    fn name(&self) -> &'static str {
        "messaging"
    }

    async fn start(&self, ctx: ServiceContext) -> Result<()> {
        if self.ctx.set(ctx.clone()).is_err() {
            return Err(BenchError::Config(
                "Messaging service is already running".to_string(),
            ));
        }
        tokio::spawn(expire_loop(self.pool.clone(), ctx, self.config.expiry_cycle));
        info!(
            "Messaging started (max message size {} bytes)",
            self.config.max_message_size
        );
        Ok(())
    }

    async fn peer_connected(&self, peer: &PeerHandle) -> Result<()> {
        let envelopes = self.live_envelopes().await;
        if envelopes.is_empty() {
            return Ok(());
        }
        debug!("Sending {} pooled envelopes to {}", envelopes.len(), peer.node_id);
        peer.send(Message::Envelopes { envelopes })
    }

    async fn handle_message(&self, peer: &PeerHandle, message: &Message) -> Result<bool> {
        match message {
            Message::Envelopes { envelopes } => {
                self.handle_envelopes(peer, envelopes).await?;
                Ok(true)
            }
            Message::P2pEnvelopes { envelopes } => {
                self.handle_p2p_envelopes(peer, envelopes).await?;
                Ok(true)
            }
            Message::MessagesRequest { envelope } => {
                let mail_server = self.mail_server.read().await.clone();
                match mail_server {
                    Some(server) => {
                        server.deliver_mail(peer, envelope).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl FilterSource for MessagingService {
    async fn poll_filter(&self, filter_id: &str) -> Result<Vec<ReceivedMessage>> {
        self.get_filter_messages(filter_id).await
    }

    async fn arrivals(&self, filter_id: &str) -> Option<watch::Receiver<u64>> {
        self.filters.read().await.arrivals(filter_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::peer::Direction;
    use tokio::sync::mpsc;

    const TOPIC: Topic = Topic::new([1, 2, 3, 4]);

    fn node_id(byte: u8) -> NodeId {
        bs58::encode([byte; 32]).into_string().parse().unwrap()
    }

    fn peer(byte: u8) -> (PeerHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(node_id(byte), "127.0.0.1:1".parse().unwrap(), Direction::Inbound, tx);
        (handle, rx)
    }

    fn sealed(password: &str) -> Envelope {
        Envelope::seal(&SymKey::from_password(password), TOPIC, b"hi", 600, unix_now()).unwrap()
    }

    async fn filter(service: &MessagingService, password: &str, allow_p2p: bool) -> String {
        let key_id = service.add_sym_key_from_password(password).await.unwrap();
        service
            .new_message_filter(Criteria {
                sym_key_id: key_id,
                topics: vec![TOPIC],
                allow_p2p,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keys() {
        let service = MessagingService::new(MessagingConfig::default());
        let a = service.add_sym_key_from_password("pw").await.unwrap();
        let b = service.add_sym_key_from_password("pw").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(
            service.get_sym_key(&a).await.unwrap(),
            service.get_sym_key(&b).await.unwrap()
        );
        assert!(service.add_sym_key_from_password("").await.is_err());
        assert!(service.delete_sym_key(&a).await);
        assert!(!service.has_sym_key(&a).await);
    }

    #[tokio::test]
    async fn test_filter_needs_known_key() {
        let service = MessagingService::new(MessagingConfig::default());
        let err = service
            .new_message_filter(Criteria {
                sym_key_id: "missing".to_string(),
                topics: vec![TOPIC],
                allow_p2p: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_gossiped_envelopes_are_pooled_and_filtered_once() {
        let service = MessagingService::new(MessagingConfig::default());
        let id = filter(&service, "pw", false).await;
        let (from, _rx) = peer(1);

        let env = sealed("pw");
        let msg = Message::Envelopes {
            envelopes: vec![env.clone(), env.clone()],
        };
        assert!(service.handle_message(&from, &msg).await.unwrap());
        assert!(service.handle_message(&from, &msg).await.unwrap());

        assert_eq!(service.pool_size().await, 1);
        let got = service.get_filter_messages(&id).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, Some(node_id(1)));
        assert!(!got[0].p2p);
    }

    #[tokio::test]
    async fn test_expired_envelopes_are_dropped() {
        let service = MessagingService::new(MessagingConfig::default());
        let (from, _rx) = peer(1);
        let env = Envelope::seal(&SymKey::from_password("pw"), TOPIC, b"old", 10, 1_000).unwrap();
        service
            .handle_message(&from, &Message::Envelopes { envelopes: vec![env] })
            .await
            .unwrap();
        assert_eq!(service.pool_size().await, 0);
    }

    #[tokio::test]
    async fn test_oversized_envelope_rejected() {
        let service = MessagingService::new(MessagingConfig {
            max_message_size: 16,
            ..Default::default()
        });
        let (from, _rx) = peer(1);
        let result = service
            .handle_message(&from, &Message::Envelopes { envelopes: vec![sealed("pw")] })
            .await;
        assert!(matches!(result, Err(BenchError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_bad_envelope_does_not_sink_batch() {
        let service = MessagingService::new(MessagingConfig::default());
        let id = filter(&service, "pw", false).await;
        let (from, _rx) = peer(1);

        let key = SymKey::from_password("pw");
        let future = Envelope::seal(&key, TOPIC, b"later", 600, unix_now() + 3600).unwrap();
        let msg = Message::Envelopes {
            envelopes: vec![future, sealed("pw")],
        };

        let result = service.handle_message(&from, &msg).await;
        assert!(matches!(result, Err(BenchError::Protocol(_))));
        assert_eq!(service.pool_size().await, 1);
        assert_eq!(service.get_filter_messages(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trusted_p2p_delivers_expired_archive() {
        let service = MessagingService::new(MessagingConfig::default());
        let id = filter(&service, "pw", true).await;
        let (server, _rx) = peer(9);
        let url = PeerUrl::new(node_id(9), "127.0.0.1:1".parse().unwrap());
        service.mark_trusted_peer(&url).await.unwrap();

        // Sealed two hours ago with a one hour TTL
        let old = Envelope::seal(
            &SymKey::from_password("pw"),
            TOPIC,
            b"archived",
            3600,
            unix_now() - 7200,
        )
        .unwrap();
        assert!(old.is_expired(unix_now()));

        service
            .handle_message(&server, &Message::P2pEnvelopes { envelopes: vec![old] })
            .await
            .unwrap();
        let got = service.get_filter_messages(&id).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"archived");
    }

    #[tokio::test]
    async fn test_p2p_envelopes_need_trusted_peer() {
        let service = MessagingService::new(MessagingConfig::default());
        let id = filter(&service, "pw", true).await;
        let (server, _rx) = peer(9);
        let msg = Message::P2pEnvelopes {
            envelopes: vec![sealed("pw")],
        };

        assert!(service.handle_message(&server, &msg).await.is_err());
        assert!(service.get_filter_messages(&id).await.unwrap().is_empty());

        let url = PeerUrl::new(node_id(9), "127.0.0.1:1".parse().unwrap());
        assert!(service.mark_trusted_peer(&url).await.unwrap());
        assert!(service.handle_message(&server, &msg).await.unwrap());
        let got = service.get_filter_messages(&id).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].p2p);
        // Point-to-point deliveries never enter the pool
        assert_eq!(service.pool_size().await, 0);
    }

    #[tokio::test]
    async fn test_requests_without_mail_server_are_not_handled() {
        let service = MessagingService::new(MessagingConfig::default());
        let (from, _rx) = peer(1);
        let msg = Message::MessagesRequest {
            envelope: sealed("pw"),
        };
        assert!(!service.handle_message(&from, &msg).await.unwrap());
    }

    #[tokio::test]
    async fn test_post_requires_start() {
        let service = MessagingService::new(MessagingConfig::default());
        let key = service.add_sym_key_from_password("pw").await.unwrap();
        let err = service
            .post(PostParams {
                sym_key_id: key,
                topic: TOPIC,
                payload: b"x".to_vec(),
                ttl: 60,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_peer_receives_pool() {
        let service = MessagingService::new(MessagingConfig::default());
        let (from, _rx1) = peer(1);
        service
            .handle_message(&from, &Message::Envelopes { envelopes: vec![sealed("pw")] })
            .await
            .unwrap();

        let (newcomer, mut rx2) = peer(2);
        service.peer_connected(&newcomer).await.unwrap();
        match rx2.recv().await {
            Some(Message::Envelopes { envelopes }) => assert_eq!(envelopes.len(), 1),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
