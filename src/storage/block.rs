use std::time::Duration;

use tokio::time::Instant;

use crate::PeerId;

/// The canonical transfer unit: 16 KiB, except possibly the last block of the
/// last piece.
pub const BLOCK_SIZE: u32 = 16384;

// Requests not fulfilled within this window are recycled by the scheduler.
pub const REQUEST_LIFESPAN: Duration = Duration::from_secs(10);

/// Identity of a block within the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// A block request threaded through the system: issued by the scheduler,
/// pipelined by a peer session and returned on the completed queue either
/// fulfilled or failed (expired / peer gone).
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub info: BlockInfo,
    pub data: Option<Vec<u8>>,
    pub successful: bool,
    pub completed_by: Option<PeerId>,
    pub expires_at: Option<Instant>,
}

impl BlockRequest {
    pub fn new(info: BlockInfo) -> Self {
        Self {
            info,
            data: None,
            successful: false,
            completed_by: None,
            expires_at: None,
        }
    }

    /// Arms the expiry clock. Called when the request goes on the wire.
    pub fn start(&mut self) {
        self.expires_at = Some(Instant::now() + REQUEST_LIFESPAN);
    }

    pub fn expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() > deadline)
    }

    /// Marks the request fulfilled with the received block data.
    pub fn fulfill(&mut self, data: Vec<u8>, completed_by: PeerId) {
        self.data = Some(data);
        self.successful = true;
        self.completed_by = Some(completed_by);
    }

    /// Marks the request failed so the scheduler re-queues the block.
    pub fn fail(&mut self) {
        self.data = None;
        self.successful = false;
        self.completed_by = None;
        self.expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_is_unarmed() {
        let request = BlockRequest::new(create_test_info());

        assert!(!request.successful);
        assert!(!request.expired());
        assert!(request.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_expires_after_lifespan() {
        let mut request = BlockRequest::new(create_test_info());
        request.start();

        assert!(!request.expired());

        tokio::time::advance(REQUEST_LIFESPAN + Duration::from_secs(1)).await;

        assert!(request.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_stops_expiring() {
        let mut request = BlockRequest::new(create_test_info());
        request.start();
        tokio::time::advance(REQUEST_LIFESPAN + Duration::from_secs(1)).await;
        request.fail();

        assert!(!request.expired());
    }

    #[test]
    fn test_fulfill_records_the_peer() {
        let mut request = BlockRequest::new(create_test_info());
        let peer_id = [7u8; 20];

        request.fulfill(vec![1, 2, 3], peer_id);

        assert!(request.successful);
        assert_eq!(request.completed_by, Some(peer_id));
        assert_eq!(request.data, Some(vec![1, 2, 3]));
    }

    // Auxiliary functions

    fn create_test_info() -> BlockInfo {
        BlockInfo {
            piece: 0,
            begin: 0,
            length: BLOCK_SIZE,
        }
    }
}
