/// mailbench - store-and-forward delivery harness
///
/// A small TCP mesh node with envelope messaging and an offline mail server,
/// plus the harness that confirms peer links, waits for message delivery and
/// runs many simulated peers against one mail server.

pub mod config;
pub mod error;
pub mod harness;
pub mod identity;
pub mod mailserver;
pub mod messaging;
pub mod node;
pub mod p2p;

pub use config::{BenchConfig, Command, NodeConfig};
pub use error::{BenchError, Result};
pub use identity::{NodeId, PeerUrl};
pub use node::{Node, RunningNode};
