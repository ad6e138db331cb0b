/// P2P networking modules
pub mod peer;
pub mod protocol;

pub use peer::{Direction, PeerEvent, PeerEventKind, PeerHandle, PeerManager};
pub use protocol::{Message, PROTOCOL_VERSION};
