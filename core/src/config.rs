/// Configuration management
use crate::error::{BenchError, Result};
use crate::identity::PeerUrl;
use crate::messaging::envelope::Topic;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Topic used by `send` and `bench` unless overridden
pub const DEFAULT_TOPIC: Topic = Topic::new([0x01, 0x02, 0x03, 0x04]);

/// Password shared between mail server and clients to authenticate requests
pub const DEFAULT_MAILSERVER_PASSWORD: &str = "mailbench-offline-inbox";

const DEFAULT_MSG_PASS: &str = "mailbench-message-password";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:30303";

/// How a node advertises its own address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatMode {
    /// Advertise the bound address, loopback if bound to an unspecified address
    Any,
    /// Same as `Any`; no mapping is attempted
    None,
    /// Advertise this external IP with the bound port
    ExtIp(IpAddr),
}

impl FromStr for NatMode {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(NatMode::Any),
            "none" => Ok(NatMode::None),
            other => {
                let ip = other.strip_prefix("extip:").ok_or_else(|| {
                    BenchError::Config(format!(
                        "Unknown NAT mode {:?} (expected any, none or extip:<ip>)",
                        other
                    ))
                })?;
                ip.parse::<IpAddr>()
                    .map(NatMode::ExtIp)
                    .map_err(|_| BenchError::Config(format!("Invalid NAT external IP {:?}", ip)))
            }
        }
    }
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listening address (port 0 picks a free port)
    pub listen_addr: SocketAddr,

    /// Maximum number of connected peers, inbound and outbound together
    pub max_peers: usize,

    /// Address advertisement
    pub nat: NatMode,

    /// TCP connect timeout
    pub connection_timeout: Duration,

    /// Time allowed for the handshake exchange
    pub handshake_timeout: Duration,

    /// Ping a peer after this long without a frame from it
    pub idle_timeout: Duration,

    /// Heartbeat (status log) interval
    pub heartbeat_interval: Duration,

    /// Redial interval for static peers
    pub retry_interval: Duration,

    /// Max connection attempts per static peer
    pub max_connection_attempts: u32,

    /// Optional data directory for a persistent identity
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 30303)),
            max_peers: 25,
            nat: NatMode::Any,
            connection_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            retry_interval: Duration::from_secs(5),
            max_connection_attempts: 5,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Restricted node used by each simulated peer: ephemeral port, one peer,
    /// no persistent state
    pub fn harness() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_peers: 1,
            ..Default::default()
        }
    }
}

/// Messaging service limits
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Envelopes larger than this are dropped
    pub max_message_size: usize,

    /// TTL used by `send` when none is given
    pub default_ttl: u32,

    /// How often expired envelopes are swept from the pool
    pub expiry_cycle: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            default_ttl: 3600,
            expiry_cycle: Duration::from_secs(10),
        }
    }
}

/// `serve`: run a mail server node
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub node: NodeConfig,
    pub messaging: MessagingConfig,
    pub mailserver_password: String,
}

/// `send`: post messages to a mail server so there is something to fetch
#[derive(Debug, Clone)]
pub struct SendConfig {
    pub mail_server: PeerUrl,
    pub count: usize,
    pub msg_pass: String,
    pub topic: Topic,
    pub ttl: u32,
    pub confirm_timeout: Duration,
    pub node: NodeConfig,
    pub messaging: MessagingConfig,
}

/// `bench`: concurrent mail server peers
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Remote mail server
    pub mail_server: PeerUrl,

    /// Number of parallel peer simulations
    pub peers: usize,

    /// Messages each peer expects, both from the pool and from the archive
    pub msg_count: i64,

    /// Password of the messages' symmetric key
    pub msg_pass: String,

    /// Password authenticating requests to the mail server
    pub mailserver_password: String,

    pub topic: Topic,

    /// Filter poll interval of the delivery waiter
    pub poll_interval: Duration,

    /// Bound on waiting for the mail server link
    pub confirm_timeout: Duration,

    /// Bound on each message wait; `None` waits forever
    pub wait_timeout: Option<Duration>,

    pub node: NodeConfig,
    pub messaging: MessagingConfig,
}

impl BenchConfig {
    pub fn new(mail_server: PeerUrl) -> Self {
        Self {
            mail_server,
            peers: 1,
            msg_count: 10,
            msg_pass: DEFAULT_MSG_PASS.to_string(),
            mailserver_password: DEFAULT_MAILSERVER_PASSWORD.to_string(),
            topic: DEFAULT_TOPIC,
            poll_interval: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(30),
            wait_timeout: Some(Duration::from_secs(300)),
            node: NodeConfig::harness(),
            messaging: MessagingConfig::default(),
        }
    }
}

/// Parsed command line
#[derive(Debug, Clone)]
pub enum Command {
    Serve(ServeConfig),
    Send(SendConfig),
    Bench(BenchConfig),
}

pub const USAGE: &str = "Usage:
  mailbench serve [--listen <addr>] [--max-peers <n>] [--nat any|none|extip:<ip>]
                  [--mailserver-password <p>] [--data-dir <path>]
  mailbench send  --peer <url> [--count <n>] [--password <p>] [--topic <hex>] [--ttl <secs>]
  mailbench bench --peer <url> [--peers <n>] [--count <n>] [--password <p>]
                  [--mailserver-password <p>] [--topic <hex>] [--poll-interval-ms <ms>]
                  [--confirm-timeout <secs>] [--wait-timeout <secs>]";

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| BenchError::Config(format!("{} requires a value", args[i])))
}

fn parse_value<T: FromStr>(args: &[String], i: usize) -> Result<T> {
    let raw = flag_value(args, i)?;
    raw.parse::<T>()
        .map_err(|_| BenchError::Config(format!("{}: invalid value {:?}", args[i], raw)))
}

/// Environment lookup; `MAILBENCH_*` variables give defaults that flags override
type Env<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_value<T: FromStr>(env: Env, name: &str) -> Option<T> {
    env(name).and_then(|s| s.parse::<T>().ok())
}

impl Command {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        Self::parse_with(args, &|name| std::env::var(name).ok())
    }

    fn parse_with(args: &[String], env: Env) -> Result<Self> {
        let sub = args
            .get(1)
            .ok_or_else(|| BenchError::Config(USAGE.to_string()))?;
        match sub.as_str() {
            "serve" => Self::parse_serve(&args[2..]).map(Command::Serve),
            "send" => Self::parse_send(&args[2..], env).map(Command::Send),
            "bench" => Self::parse_bench(&args[2..], env).map(Command::Bench),
            other => Err(BenchError::Config(format!(
                "Unknown command {:?}\n{}",
                other, USAGE
            ))),
        }
    }

    fn parse_serve(args: &[String]) -> Result<ServeConfig> {
        let mut node = NodeConfig {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .map_err(|_| BenchError::Config("Invalid listen address".to_string()))?,
            ..Default::default()
        };
        let mut mailserver_password = DEFAULT_MAILSERVER_PASSWORD.to_string();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--listen" => node.listen_addr = parse_value(args, i)?,
                "--max-peers" => node.max_peers = parse_value(args, i)?,
                "--nat" => node.nat = parse_value(args, i)?,
                "--mailserver-password" => mailserver_password = flag_value(args, i)?.to_string(),
                "--data-dir" => node.data_dir = Some(PathBuf::from(flag_value(args, i)?)),
                other => {
                    return Err(BenchError::Config(format!("Unknown serve option {:?}", other)))
                }
            }
            i += 2;
        }

        if node.max_peers == 0 {
            return Err(BenchError::Config("--max-peers must be at least 1".to_string()));
        }

        Ok(ServeConfig {
            node,
            messaging: MessagingConfig::default(),
            mailserver_password,
        })
    }

    fn parse_send(args: &[String], env: Env) -> Result<SendConfig> {
        let messaging = MessagingConfig::default();
        let mut mail_server: Option<PeerUrl> = env_value(env, "MAILBENCH_PEER");
        let mut count = env_value(env, "MAILBENCH_MSG_COUNT").unwrap_or(10usize);
        let mut msg_pass = env("MAILBENCH_MSG_PASS").unwrap_or_else(|| DEFAULT_MSG_PASS.to_string());
        let mut topic = DEFAULT_TOPIC;
        let mut ttl = messaging.default_ttl;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--peer" => mail_server = Some(parse_value(args, i)?),
                "--count" => count = parse_value(args, i)?,
                "--password" => msg_pass = flag_value(args, i)?.to_string(),
                "--topic" => topic = parse_value(args, i)?,
                "--ttl" => ttl = parse_value(args, i)?,
                other => {
                    return Err(BenchError::Config(format!("Unknown send option {:?}", other)))
                }
            }
            i += 2;
        }

        let mail_server = mail_server
            .ok_or_else(|| BenchError::Config("send requires --peer <url>".to_string()))?;

        Ok(SendConfig {
            mail_server,
            count,
            msg_pass,
            topic,
            ttl,
            confirm_timeout: Duration::from_secs(30),
            node: NodeConfig::harness(),
            messaging,
        })
    }

    fn parse_bench(args: &[String], env: Env) -> Result<BenchConfig> {
        let mut mail_server: Option<PeerUrl> = env_value(env, "MAILBENCH_PEER");
        let mut peers: Option<usize> = env_value(env, "MAILBENCH_PEERS");
        let mut msg_count: Option<i64> = env_value(env, "MAILBENCH_MSG_COUNT");
        let mut msg_pass: Option<String> = env("MAILBENCH_MSG_PASS");
        let mut mailserver_password: Option<String> = None;
        let mut topic: Option<Topic> = None;
        let mut poll_interval: Option<Duration> = None;
        let mut confirm_timeout: Option<Duration> = None;
        let mut wait_timeout: Option<Option<Duration>> = None;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--peer" => mail_server = Some(parse_value(args, i)?),
                "--peers" => peers = Some(parse_value(args, i)?),
                "--count" => msg_count = Some(parse_value(args, i)?),
                "--password" => msg_pass = Some(flag_value(args, i)?.to_string()),
                "--mailserver-password" => {
                    mailserver_password = Some(flag_value(args, i)?.to_string())
                }
                "--topic" => topic = Some(parse_value(args, i)?),
                "--poll-interval-ms" => {
                    poll_interval = Some(Duration::from_millis(parse_value(args, i)?))
                }
                "--confirm-timeout" => {
                    confirm_timeout = Some(Duration::from_secs(parse_value(args, i)?))
                }
                "--wait-timeout" => {
                    let secs: u64 = parse_value(args, i)?;
                    wait_timeout = Some((secs > 0).then(|| Duration::from_secs(secs)));
                }
                other => {
                    return Err(BenchError::Config(format!("Unknown bench option {:?}", other)))
                }
            }
            i += 2;
        }

        let mail_server = mail_server
            .ok_or_else(|| BenchError::Config("bench requires --peer <url>".to_string()))?;
        let mut config = BenchConfig::new(mail_server);
        if let Some(n) = peers {
            if n == 0 {
                return Err(BenchError::Config("--peers must be at least 1".to_string()));
            }
            config.peers = n;
        }
        if let Some(n) = msg_count {
            config.msg_count = n;
        }
        if let Some(p) = msg_pass {
            config.msg_pass = p;
        }
        if let Some(p) = mailserver_password {
            config.mailserver_password = p;
        }
        if let Some(t) = topic {
            config.topic = t;
        }
        if let Some(d) = poll_interval {
            config.poll_interval = d;
        }
        if let Some(d) = confirm_timeout {
            config.confirm_timeout = d;
        }
        if let Some(d) = wait_timeout {
            config.wait_timeout = d;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> String {
        format!("mesh://{}@127.0.0.1:30303", bs58::encode([7u8; 32]).into_string())
    }

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mailbench")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_nat_mode_parse() {
        assert_eq!("any".parse::<NatMode>().unwrap(), NatMode::Any);
        assert_eq!("none".parse::<NatMode>().unwrap(), NatMode::None);
        assert_eq!(
            "extip:10.0.0.1".parse::<NatMode>().unwrap(),
            NatMode::ExtIp("10.0.0.1".parse().unwrap())
        );
        assert!("upnp".parse::<NatMode>().is_err());
        assert!("extip:nope".parse::<NatMode>().is_err());
    }

    #[test]
    fn test_serve_defaults_and_flags() {
        let Command::Serve(cfg) = Command::from_args(&args(&["serve"])).unwrap() else {
            panic!("expected serve");
        };
        assert_eq!(cfg.node.listen_addr.port(), 30303);
        assert_eq!(cfg.mailserver_password, DEFAULT_MAILSERVER_PASSWORD);

        let Command::Serve(cfg) = Command::from_args(&args(&[
            "serve",
            "--listen",
            "127.0.0.1:4000",
            "--max-peers",
            "100",
            "--nat",
            "extip:1.2.3.4",
            "--data-dir",
            "/tmp/ms",
        ]))
        .unwrap() else {
            panic!("expected serve");
        };
        assert_eq!(cfg.node.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(cfg.node.max_peers, 100);
        assert_eq!(cfg.node.nat, NatMode::ExtIp("1.2.3.4".parse().unwrap()));
        assert_eq!(cfg.node.data_dir, Some(PathBuf::from("/tmp/ms")));
    }

    #[test]
    fn test_bench_flags() {
        let url = url();
        let Command::Bench(cfg) = Command::from_args(&args(&[
            "bench",
            "--peer",
            &url,
            "--peers",
            "8",
            "--count",
            "0",
            "--topic",
            "0xdeadbeef",
            "--poll-interval-ms",
            "250",
            "--wait-timeout",
            "0",
        ]))
        .unwrap() else {
            panic!("expected bench");
        };
        assert_eq!(cfg.mail_server.to_string(), url);
        assert_eq!(cfg.peers, 8);
        assert_eq!(cfg.msg_count, 0);
        assert_eq!(cfg.topic, Topic::new([0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.wait_timeout, None);
        assert_eq!(cfg.node.max_peers, 1);
    }

    #[test]
    fn test_flags_override_environment() {
        let url = url();
        let other = format!("mesh://{}@127.0.0.1:1", bs58::encode([8u8; 32]).into_string());
        let env = move |name: &str| match name {
            "MAILBENCH_PEER" => Some(other.clone()),
            "MAILBENCH_PEERS" => Some("4".to_string()),
            "MAILBENCH_MSG_COUNT" => Some("7".to_string()),
            "MAILBENCH_MSG_PASS" => Some("from-env".to_string()),
            _ => None,
        };

        let Command::Bench(cfg) = Command::parse_with(&args(&["bench"]), &env).unwrap() else {
            panic!("expected bench");
        };
        assert_eq!(cfg.peers, 4);
        assert_eq!(cfg.msg_count, 7);
        assert_eq!(cfg.msg_pass, "from-env");

        let Command::Bench(cfg) = Command::parse_with(
            &args(&["bench", "--peer", &url, "--peers", "2", "--password", "flag"]),
            &env,
        )
        .unwrap() else {
            panic!("expected bench");
        };
        assert_eq!(cfg.mail_server.to_string(), url);
        assert_eq!(cfg.peers, 2);
        assert_eq!(cfg.msg_count, 7);
        assert_eq!(cfg.msg_pass, "flag");

        let Command::Send(cfg) =
            Command::parse_with(&args(&["send", "--peer", &url, "--count", "3"]), &env).unwrap()
        else {
            panic!("expected send");
        };
        assert_eq!(cfg.mail_server.to_string(), url);
        assert_eq!(cfg.count, 3);
        assert_eq!(cfg.msg_pass, "from-env");
    }

    #[test]
    fn test_errors() {
        assert!(Command::from_args(&args(&[])).is_err());
        assert!(Command::from_args(&args(&["fly"])).is_err());
        assert!(Command::from_args(&args(&["bench", "--peer"])).is_err());
        assert!(Command::from_args(&args(&["bench", "--peer", "nope"])).is_err());
        let url = url();
        assert!(Command::from_args(&args(&["bench", "--peer", &url, "--peers", "0"])).is_err());
        assert!(Command::from_args(&args(&["serve", "--bogus", "1"])).is_err());
    }
}
