/// Peer confirmation gate: turn the asynchronous "peer added" signal into a
/// blocking call with a deadline
use crate::error::{BenchError, Result};
use crate::identity::PeerUrl;
use crate::p2p::peer::{PeerEvent, PeerEventKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::debug;

/// The slice of a node the gate needs
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Subscribe to peer added/removed events
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;

    /// Ask the node to connect to `url`; returns before the link is up
    async fn add_peer(&self, url: &PeerUrl) -> Result<()>;
}

/// Connect to `url` and wait until the node reports it as added.
///
/// The first event observed after the request decides the outcome: `Added`
/// for `url.id` succeeds, anything else fails with
/// [`BenchError::UnexpectedEvent`]. Waiting longer than `deadline` fails with
/// [`BenchError::Timeout`].
pub async fn add_peer_with_confirmation<C>(conn: &C, url: &PeerUrl, deadline: Duration) -> Result<()>
where
    C: Connectivity + ?Sized,
{
    // Subscribe before the request, or a fast "added" could be missed
    let mut events = conn.subscribe_events();
    conn.add_peer(url).await?;

    let event = match timeout(deadline, events.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(RecvError::Closed)) => {
            return Err(BenchError::Connection("peer event stream closed".to_string()))
        }
        Ok(Err(RecvError::Lagged(missed))) => {
            return Err(BenchError::Connection(format!(
                "missed {} peer events while waiting for {}",
                missed, url.id
            )))
        }
        Err(_) => {
            return Err(BenchError::Timeout(format!(
                "peer {} not added within {:?}",
                url.id, deadline
            )))
        }
    };

    if event.kind == PeerEventKind::Added && event.peer == url.id {
        debug!("Peer {} confirmed", url.id);
        Ok(())
    } else {
        Err(BenchError::UnexpectedEvent(event))
    }
}
