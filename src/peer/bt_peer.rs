use std::net::SocketAddrV4;

use crate::PeerId;

/// `BtPeer` struct containing individual peer information.
///
/// Peers are compared and hashed by address: the peer ID is only known after
/// the handshake.
#[derive(Debug, Clone)]
pub struct BtPeer {
    pub peer_id: Option<PeerId>,
    pub addr: SocketAddrV4,
}

impl PartialEq for BtPeer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for BtPeer {}

impl std::hash::Hash for BtPeer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl BtPeer {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            peer_id: None,
            addr,
        }
    }

    pub fn with_id(addr: SocketAddrV4, peer_id: PeerId) -> Self {
        Self {
            peer_id: Some(peer_id),
            addr,
        }
    }
}
