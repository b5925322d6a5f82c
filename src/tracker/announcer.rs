use std::net::{Ipv4Addr, SocketAddrV4};

/// Lifecycle event reported alongside an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    None,
    Stopped,
    Completed,
}

/// The transfer counters reported on every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A successful announce: when to come back and who else is in the swarm.
/// Peers come as compact `(ipv4, port)` pairs.
#[derive(Debug, Clone)]
pub struct Announce {
    pub interval: u32,
    pub peers: Vec<(u32, u16)>,
}

impl Announce {
    pub fn peer_addrs(&self) -> Vec<SocketAddrV4> {
        self.peers
            .iter()
            .map(|(ip, port)| SocketAddrV4::new(Ipv4Addr::from(*ip), *port))
            .collect()
    }
}

/// Posible announce errors.
#[derive(Debug)]
pub enum AnnounceError {
    AnnounceFailed(String),
}

/// The tracker seam: the engine periodically calls this with its lifecycle
/// events and counters and gets back fresh peers. HTTP/UDP tracker clients
/// implement it outside the engine.
pub trait Announcer: Send + Sync {
    fn announce(
        &self,
        event: AnnounceEvent,
        stats: &TransferStats,
    ) -> Result<Announce, AnnounceError>;
}
