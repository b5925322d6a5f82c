/// Represents our status in the peer session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// We are choking the other peer
    pub am_choking: bool,
    /// We are interested in the other peer
    pub am_interested: bool,
    /// The other peer is choking us
    pub peer_choking: bool,
    /// The other peer is interested in us
    pub peer_interested: bool,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}
