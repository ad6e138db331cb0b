/// Peer simulation runner: many short-lived nodes, each fetching pooled and
/// archived mail from one server
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::harness::gate::add_peer_with_confirmation;
use crate::harness::waiter::{wait_for_messages, WaitOptions, WaitReport};
use crate::identity::NodeId;
use crate::mailserver::MailClient;
use crate::messaging::{Criteria, MessagingService};
use crate::node::Node;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info};

/// What one successful peer simulation observed
#[derive(Debug, Clone)]
pub struct PeerReport {
    pub index: usize,
    pub node_id: NodeId,
    /// Messages gossiped from the server's pool on connect
    pub pooled: WaitReport,
    /// Messages replayed from the server's archive on request
    pub archived: WaitReport,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum PeerOutcome {
    Success(PeerReport),
    Failed { index: usize, error: String },
}

impl PeerOutcome {
    pub fn index(&self) -> usize {
        match self {
            PeerOutcome::Success(report) => report.index,
            PeerOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PeerOutcome::Success(_))
    }
}

impl fmt::Display for PeerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerOutcome::Success(r) => write!(
                f,
                "peer {} ({}): ok, {} pooled in {} polls, {} archived in {} polls, {:.2?}",
                r.index,
                r.node_id,
                r.pooled.received,
                r.pooled.polls,
                r.archived.received,
                r.archived.polls,
                r.elapsed
            ),
            PeerOutcome::Failed { index, error } => write!(f, "peer {}: FAILED: {}", index, error),
        }
    }
}

/// One entry per simulated peer, ordered by index
#[derive(Debug, Clone)]
pub struct BenchSummary {
    pub outcomes: Vec<PeerOutcome>,
    pub elapsed: Duration,
}

impl BenchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

impl fmt::Display for BenchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "{}", outcome)?;
        }
        write!(
            f,
            "{} peers: {} succeeded, {} failed in {:.2?}",
            self.outcomes.len(),
            self.succeeded(),
            self.failed(),
            self.elapsed
        )
    }
}

/// Wait on a filter, then delete it whatever the wait returned
async fn drain_filter(
    messaging: &MessagingService,
    filter_id: &str,
    target: i64,
    options: WaitOptions,
) -> Result<WaitReport> {
    let waited = wait_for_messages(target, messaging, filter_id, options).await;
    messaging.delete_message_filter(filter_id).await;
    waited
}

/// A filter must start out empty; anything else means deliveries leaked into it
async fn expect_empty(messaging: &MessagingService, filter_id: &str) -> Result<()> {
    let early = messaging.get_filter_messages(filter_id).await?;
    if !early.is_empty() {
        return Err(BenchError::Filter(format!(
            "new filter {} already held {} messages",
            filter_id,
            early.len()
        )));
    }
    Ok(())
}

/// Run one simulated peer against the configured mail server
pub async fn run_peer(config: Arc<BenchConfig>, index: usize) -> Result<PeerReport> {
    let started = Instant::now();
    let options = WaitOptions {
        interval: config.poll_interval,
        timeout: config.wait_timeout,
    };

    let messaging = Arc::new(MessagingService::new(config.messaging.clone()));
    let mail_client = Arc::new(MailClient::new(messaging.clone()));
    let node = Node::new(config.node.clone())?;
    node.register(messaging.clone()).await?;
    node.register(mail_client.clone()).await?;

    // The server gossips its pool as soon as we connect, so the filter must
    // exist before the node does
    let msg_key = messaging.add_sym_key_from_password(&config.msg_pass).await?;
    let pooled_filter = messaging
        .new_message_filter(Criteria {
            sym_key_id: msg_key.clone(),
            topics: vec![config.topic],
            allow_p2p: false,
        })
        .await?;
    expect_empty(&messaging, &pooled_filter).await?;

    let running = node.start().await?;
    info!("Peer {} started as {}", index, running.id);

    add_peer_with_confirmation(&*running, &config.mail_server, config.confirm_timeout).await?;
    let pooled = drain_filter(&messaging, &pooled_filter, config.msg_count, options).await?;
    info!("Peer {}: {} pooled messages in {} polls", index, pooled.received, pooled.polls);

    let archive_filter = messaging
        .new_message_filter(Criteria {
            sym_key_id: msg_key,
            topics: vec![config.topic],
            allow_p2p: true,
        })
        .await?;
    if let Err(e) = expect_empty(&messaging, &archive_filter).await {
        messaging.delete_message_filter(&archive_filter).await;
        return Err(e);
    }
    let mail_key = messaging
        .add_sym_key_from_password(&config.mailserver_password)
        .await?;

    if !messaging.mark_trusted_peer(&config.mail_server).await? {
        messaging.delete_message_filter(&archive_filter).await;
        return Err(BenchError::Peer(format!(
            "Could not trust mail server {}",
            config.mail_server.id
        )));
    }
    match mail_client
        .request_messages(&config.mail_server, &mail_key, config.topic)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            messaging.delete_message_filter(&archive_filter).await;
            return Err(BenchError::Peer(format!(
                "Mail server {} refused the request",
                config.mail_server.id
            )));
        }
        Err(e) => {
            messaging.delete_message_filter(&archive_filter).await;
            return Err(e);
        }
    }

    let archived = drain_filter(&messaging, &archive_filter, config.msg_count, options).await?;
    info!(
        "Peer {}: {} archived messages in {} polls",
        index, archived.received, archived.polls
    );

    let node_id = running.id.clone();
    running.stop().await?;

    Ok(PeerReport {
        index,
        node_id,
        pooled,
        archived,
        elapsed: started.elapsed(),
    })
}

/// Run one simulation in its own task so a panic still maps to its index
async fn supervise<F>(index: usize, run: F) -> PeerOutcome
where
    F: Future<Output = Result<PeerReport>> + Send + 'static,
{
    match tokio::spawn(run).await {
        Ok(Ok(report)) => PeerOutcome::Success(report),
        Ok(Err(e)) => PeerOutcome::Failed {
            index,
            error: e.to_string(),
        },
        Err(e) => PeerOutcome::Failed {
            index,
            error: format!("task aborted: {}", e),
        },
    }
}

/// Join every supervisor; an index without an outcome is reported as failed
async fn collect_outcomes(mut set: JoinSet<PeerOutcome>, peers: usize) -> Vec<PeerOutcome> {
    let mut outcomes = Vec::with_capacity(peers);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => {
                if let PeerOutcome::Failed { index, error } = &outcome {
                    error!("Peer {} failed: {}", index, error);
                }
                outcomes.push(outcome);
            }
            Err(e) => error!("Peer supervisor task failed: {}", e),
        }
    }

    let reported: HashSet<usize> = outcomes.iter().map(PeerOutcome::index).collect();
    for index in (0..peers).filter(|i| !reported.contains(i)) {
        outcomes.push(PeerOutcome::Failed {
            index,
            error: "supervisor task lost".to_string(),
        });
    }
    outcomes
}

/// Run `config.peers` simulations at once and collect one outcome per peer.
///
/// A failing or panicking simulation is reported and never cancels the others.
pub async fn run_concurrent(config: Arc<BenchConfig>) -> BenchSummary {
    let started = Instant::now();
    info!(
        "Running {} peers against {} ({} messages each)",
        config.peers, config.mail_server, config.msg_count
    );

    let mut set = JoinSet::new();
    for index in 0..config.peers {
        set.spawn(supervise(index, run_peer(config.clone(), index)));
    }
    let mut outcomes = collect_outcomes(set, config.peers).await;
    outcomes.sort_by_key(PeerOutcome::index);

    BenchSummary {
        outcomes,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerUrl;

    fn unreachable_config(peers: usize) -> Arc<BenchConfig> {
        let id = bs58::encode([4u8; 32]).into_string();
        // Port 1 on loopback refuses connections
        let url: PeerUrl = format!("mesh://{}@127.0.0.1:1", id).parse().unwrap();
        let mut config = BenchConfig::new(url);
        config.peers = peers;
        config.confirm_timeout = Duration::from_millis(300);
        config.wait_timeout = Some(Duration::from_secs(1));
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_every_peer_reports() {
        let summary = run_concurrent(unreachable_config(3)).await;
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.failed(), 3);
        let indices: Vec<usize> = summary.outcomes.iter().map(PeerOutcome::index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(summary.to_string().contains("3 peers: 0 succeeded, 3 failed"));
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out() {
        let err = run_peer(unreachable_config(1), 0).await.unwrap_err();
        assert!(matches!(err, BenchError::Timeout(_)), "got {}", err);
    }

    fn simulation_crashes() -> bool {
        true
    }

    #[tokio::test]
    async fn test_panicking_simulation_is_reported() {
        let outcome = supervise(4, async {
            if simulation_crashes() {
                panic!("boom");
            }
            Err(BenchError::Peer("not reached".to_string()))
        })
        .await;
        match outcome {
            PeerOutcome::Failed { index, error } => {
                assert_eq!(index, 4);
                assert!(error.contains("panicked"), "got {}", error);
            }
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_supervisor_still_yields_outcome() {
        let mut set = JoinSet::new();
        set.spawn(async {
            PeerOutcome::Failed {
                index: 0,
                error: "refused".to_string(),
            }
        });
        let lost = set.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            PeerOutcome::Failed {
                index: 1,
                error: "unreachable".to_string(),
            }
        });
        lost.abort();

        let mut outcomes = collect_outcomes(set, 2).await;
        outcomes.sort_by_key(PeerOutcome::index);
        assert_eq!(outcomes.len(), 2);
        match &outcomes[1] {
            PeerOutcome::Failed { index, error } => {
                assert_eq!(*index, 1);
                assert_eq!(error, "supervisor task lost");
            }
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[tokio::test]
    async fn test_new_filter_must_be_empty() {
        use crate::config::MessagingConfig;
        use crate::messaging::envelope::{unix_now, Envelope, SymKey, Topic};
        use crate::p2p::peer::{Direction, PeerHandle};
        use crate::p2p::protocol::Message;
        use crate::node::Service;

        let topic = Topic::new([1, 2, 3, 4]);
        let messaging = MessagingService::new(MessagingConfig::default());
        let key = messaging.add_sym_key_from_password("pw").await.unwrap();
        let id = messaging
            .new_message_filter(Criteria {
                sym_key_id: key,
                topics: vec![topic],
                allow_p2p: false,
            })
            .await
            .unwrap();
        expect_empty(&messaging, &id).await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let from = PeerHandle::new(
            bs58::encode([2u8; 32]).into_string().parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
            Direction::Inbound,
            tx,
        );
        let env = Envelope::seal(&SymKey::from_password("pw"), topic, b"early", 60, unix_now()).unwrap();
        messaging
            .handle_message(&from, &Message::Envelopes { envelopes: vec![env] })
            .await
            .unwrap();

        let err = expect_empty(&messaging, &id).await.unwrap_err();
        assert!(matches!(err, BenchError::Filter(_)));
    }
}
