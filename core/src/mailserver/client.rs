/// Mail client: asks a mail server to replay its archive
use super::{MailRequest, MAX_REQUEST_LIMIT};
use crate::error::{BenchError, Result};
use crate::identity::PeerUrl;
use crate::messaging::envelope::{unix_now, Envelope, Topic};
use crate::messaging::MessagingService;
use crate::node::{Service, ServiceContext};
use crate::p2p::peer::PeerHandle;
use crate::p2p::protocol::Message;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// How far back a request reaches
const REQUEST_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Lifetime of the request envelope itself
const REQUEST_TTL: u32 = 60;

pub struct MailClient {
    messaging: Arc<MessagingService>,
    ctx: OnceLock<ServiceContext>,
}

impl MailClient {
    pub fn new(messaging: Arc<MessagingService>) -> Self {
        Self {
            messaging,
            ctx: OnceLock::new(),
        }
    }

    /// Request everything on `topic` from the last day, sealed with the key
    /// `sym_key_id` (the mail server password key).
    ///
    /// Returns once the request is queued; archived envelopes arrive later
    /// as point-to-point deliveries.
    pub async fn request_messages(&self, url: &PeerUrl, sym_key_id: &str, topic: Topic) -> Result<bool> {
        let ctx = self
            .ctx
            .get()
            .ok_or_else(|| BenchError::Config("Mail client not started".to_string()))?;
        let peer = ctx
            .peers
            .get_peer(&url.id)
            .await
            .ok_or_else(|| BenchError::Connection(format!("Mail server {} is not connected", url.id)))?;
        let key = self.messaging.get_sym_key(sym_key_id).await?;

        let now = unix_now();
        let request = MailRequest {
            from: now.saturating_sub(REQUEST_WINDOW_SECS),
            to: now,
            topic,
            limit: MAX_REQUEST_LIMIT,
        };
        let body = serde_json::to_vec(&request)?;
        let envelope = Envelope::seal(&key, topic, &body, REQUEST_TTL, now)?;

        peer.send(Message::MessagesRequest { envelope })?;
        info!("Requested archived messages on {} from {}", topic, url.id);
        Ok(true)
    }
}

#[async_trait]
impl Service for MailClient {
    fn name(&self) -> &'static str {
        "mailclient"
    }

    async fn start(&self, ctx: ServiceContext) -> Result<()> {
        if self.ctx.set(ctx).is_err() {
            return Err(BenchError::Config("Mail client is already running".to_string()));
        }
        Ok(())
    }

    async fn handle_message(&self, _peer: &PeerHandle, _message: &Message) -> Result<bool> {
        Ok(false)
    }
}
