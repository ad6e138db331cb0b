/// Delivery harness: peer confirmation gate, message waiter, peer runner
pub mod gate;
pub mod runner;
pub mod waiter;

pub use gate::{add_peer_with_confirmation, Connectivity};
pub use runner::{run_concurrent, run_peer, BenchSummary, PeerOutcome, PeerReport};
pub use waiter::{wait_for_messages, FilterSource, WaitOptions, WaitReport};
