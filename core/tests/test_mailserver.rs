/// End-to-end delivery: a mail server, a sender and concurrent bench peers
extern crate mailbench_core;

use mailbench_core::config::{MessagingConfig, DEFAULT_TOPIC};
use mailbench_core::harness::{add_peer_with_confirmation, run_concurrent};
use mailbench_core::mailserver::{Archive, MailServer};
use mailbench_core::messaging::{MessagingService, PostParams};
use mailbench_core::{BenchConfig, BenchError, Node, NodeConfig, PeerUrl, RunningNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const MSG_PASS: &str = "integration-messages";
const MAIL_PASS: &str = "integration-inbox";

async fn start_server() -> (RunningNode, Arc<MailServer>) {
    let mail_server = Arc::new(MailServer::new(Archive::temporary().unwrap(), MAIL_PASS));
    let messaging = Arc::new(MessagingService::new(MessagingConfig::default()));
    messaging.register_mail_server(mail_server.clone()).await;

    let node = Node::new(NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_peers: 10,
        ..Default::default()
    })
    .expect("Failed to create server node");
    node.register(messaging).await.unwrap();
    (node.start().await.expect("Failed to start server"), mail_server)
}

async fn send_messages(server: &PeerUrl, count: usize) {
    let messaging = Arc::new(MessagingService::new(MessagingConfig::default()));
    let node = Node::new(NodeConfig::harness()).unwrap();
    node.register(messaging.clone()).await.unwrap();
    let running = node.start().await.unwrap();

    add_peer_with_confirmation(&*running, server, Duration::from_secs(10))
        .await
        .expect("Sender could not reach the server");
    let key = messaging.add_sym_key_from_password(MSG_PASS).await.unwrap();
    for i in 0..count {
        messaging
            .post(PostParams {
                sym_key_id: key.clone(),
                topic: DEFAULT_TOPIC,
                payload: format!("message {}", i).into_bytes(),
                ttl: 600,
            })
            .await
            .unwrap();
    }

    // No pause: a graceful stop flushes the posted envelopes first
    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_peers_fetch_pool_and_archive() {
    let (server, mail_server) = start_server().await;
    let url = server.peer_url().expect("Server has no URL");

    send_messages(&url, 5).await;
    timeout(Duration::from_secs(10), async {
        while mail_server.archived() < 5 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Server never archived the messages");

    let mut config = BenchConfig::new(url);
    config.peers = 3;
    config.msg_count = 5;
    config.msg_pass = MSG_PASS.to_string();
    config.mailserver_password = MAIL_PASS.to_string();
    config.poll_interval = Duration::from_millis(100);
    config.confirm_timeout = Duration::from_secs(10);
    config.wait_timeout = Some(Duration::from_secs(20));

    let summary = run_concurrent(Arc::new(config)).await;
    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.failed(), 0, "{}", summary);
    assert_eq!(mail_server.served(), 3);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_times_out_on_archive() {
    let (server, mail_server) = start_server().await;
    let url = server.peer_url().unwrap();
    send_messages(&url, 2).await;
    timeout(Duration::from_secs(10), async {
        while mail_server.archived() < 2 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let mut config = BenchConfig::new(url);
    config.msg_count = 2;
    config.msg_pass = MSG_PASS.to_string();
    config.mailserver_password = "not-the-password".to_string();
    config.poll_interval = Duration::from_millis(50);
    config.wait_timeout = Some(Duration::from_secs(2));

    let summary = run_concurrent(Arc::new(config)).await;
    assert_eq!(summary.failed(), 1);
    assert!(summary.to_string().contains("Timeout"), "{}", summary);
    assert_eq!(mail_server.served(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_gate_rejects_wrong_identity() {
    let (server, _) = start_server().await;
    let real = server.peer_url().unwrap();
    let impostor_id = bs58::encode([8u8; 32]).into_string().parse().unwrap();
    let impostor = PeerUrl::new(impostor_id, real.addr);

    let client = Node::new(NodeConfig::harness()).unwrap();
    let running = client.start().await.unwrap();
    let err = add_peer_with_confirmation(&*running, &impostor, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Timeout(_)), "got {}", err);

    running.stop().await.unwrap();
    server.stop().await.unwrap();
}
