/// mailbench - mail server, message sender and concurrent delivery bench
use mailbench_core::config::{SendConfig, ServeConfig, USAGE};
use mailbench_core::harness::{add_peer_with_confirmation, run_concurrent};
use mailbench_core::mailserver::{Archive, MailServer};
use mailbench_core::messaging::{MessagingService, PostParams};
use mailbench_core::{BenchConfig, Command, Node};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }
    let command = Command::from_args(&args).map_err(|e| anyhow::anyhow!("{}", e))?;

    match command {
        Command::Serve(config) => serve(config).await,
        Command::Send(config) => send(config).await,
        Command::Bench(config) => bench(config).await,
    }
}

async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    let archive = match &config.node.data_dir {
        Some(dir) => Archive::open(dir)?,
        None => Archive::temporary()?,
    };
    let mail_server = Arc::new(MailServer::new(archive, &config.mailserver_password));
    let messaging = Arc::new(MessagingService::new(config.messaging.clone()));
    messaging.register_mail_server(mail_server.clone()).await;

    let node = Node::new(config.node.clone())?;
    node.register(messaging.clone()).await?;
    let running = node.start().await?;

    info!("Mail server ready ({} archived envelopes)", mail_server.archived());
    if let Some(url) = running.peer_url() {
        println!("{}", url);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    running.stop().await?;
    info!(
        "Served {} requests, {} envelopes archived",
        mail_server.served(),
        mail_server.archived()
    );
    Ok(())
}

async fn send(config: SendConfig) -> anyhow::Result<()> {
    let messaging = Arc::new(MessagingService::new(config.messaging.clone()));
    let node = Node::new(config.node.clone())?;
    node.register(messaging.clone()).await?;
    let running = node.start().await?;

    add_peer_with_confirmation(&*running, &config.mail_server, config.confirm_timeout).await?;
    let key = messaging.add_sym_key_from_password(&config.msg_pass).await?;

    for i in 0..config.count {
        let hash = messaging
            .post(PostParams {
                sym_key_id: key.clone(),
                topic: config.topic,
                payload: format!("mailbench message {}", i).into_bytes(),
                ttl: config.ttl,
            })
            .await?;
        info!("Posted {} ({}/{})", hash, i + 1, config.count);
    }

    // Stopping flushes every queued envelope before the close
    running.stop().await?;
    println!("Sent {} messages to {}", config.count, config.mail_server);
    Ok(())
}

async fn bench(config: BenchConfig) -> anyhow::Result<()> {
    let summary = run_concurrent(Arc::new(config)).await;
    println!("{}", summary);
    if summary.failed() > 0 {
        anyhow::bail!("{} of {} peers failed", summary.failed(), summary.outcomes.len());
    }
    Ok(())
}
