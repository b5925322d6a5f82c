pub mod bt_peer;
pub mod command;
pub mod peer_session;
pub mod pending;
pub mod session_status;

pub use bt_peer::BtPeer;
pub use command::PeerCommand;
pub use peer_session::{handshake_incoming, handshake_outgoing, PeerSession, PeerSessionError};
pub use pending::PendingRequests;
pub use session_status::SessionStatus;
