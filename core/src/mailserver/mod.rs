/// Mail server: archives pooled envelopes and replays them to peers that
/// ask with the right password
pub mod archive;
pub mod client;

pub use archive::Archive;
pub use client::MailClient;

use crate::error::Result;
use crate::messaging::envelope::{unix_now, Envelope, SymKey, Topic};
use crate::messaging::MailServerHandler;
use crate::p2p::peer::PeerHandle;
use crate::p2p::protocol::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Envelopes per `p2p_envelopes` message
const DELIVERY_BATCH: usize = 64;

/// Upper bound on envelopes returned for one request
pub const MAX_REQUEST_LIMIT: usize = 10_000;

/// Body of a `messages_request`, sealed with the mail server key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRequest {
    /// Lower bound on send time, unix seconds
    pub from: u64,
    /// Upper bound on send time, unix seconds
    pub to: u64,
    pub topic: Topic,
    pub limit: usize,
}

pub struct MailServer {
    archive: Archive,
    key: SymKey,
    served: AtomicU64,
}

impl MailServer {
    pub fn new(archive: Archive, password: &str) -> Self {
        Self {
            archive,
            key: SymKey::from_password(password),
            served: AtomicU64::new(0),
        }
    }

    pub fn archived(&self) -> usize {
        self.archive.count()
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    fn decode_request(&self, request: &Envelope) -> Option<MailRequest> {
        let plain = request.open(&self.key)?;
        serde_json::from_slice(&plain).ok()
    }
}

#[async_trait]
impl MailServerHandler for MailServer {
    async fn archive(&self, envelope: &Envelope) -> Result<()> {
        if self.archive.save(envelope)? {
            debug!("Archived envelope {} ({} total)", envelope.hash(), self.archive.count());
        }
        Ok(())
    }

    async fn deliver_mail(&self, peer: &PeerHandle, request: &Envelope) -> Result<()> {
        if request.is_expired(unix_now()) {
            warn!("Expired mail request from {}", peer.node_id);
            return Ok(());
        }
        let Some(req) = self.decode_request(request) else {
            warn!("Undecodable mail request from {}", peer.node_id);
            return Ok(());
        };

        let limit = req.limit.min(MAX_REQUEST_LIMIT);
        let envelopes = self.archive.query(req.from, req.to, req.topic, limit)?;
        info!(
            "Delivering {} archived envelopes on {} to {}",
            envelopes.len(),
            req.topic,
            peer.node_id
        );

        for batch in envelopes.chunks(DELIVERY_BATCH) {
            peer.send(Message::P2pEnvelopes {
                envelopes: batch.to_vec(),
            })?;
        }
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
