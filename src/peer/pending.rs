use crate::storage::{BlockInfo, BlockRequest};

/// The ordered list of requests a peer session has on the wire.
///
/// Owned exclusively by the session's task; the scheduler only sees the
/// length through the shared pending counter on the peer handle.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Vec<BlockRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self { requests: vec![] }
    }

    pub fn push(&mut self, request: BlockRequest) {
        self.requests.push(request);
    }

    /// Removes and returns the pending request matching a `Piece` reply.
    /// The reply must match piece, offset and length; anything else is a
    /// delayed answer to a request that already expired.
    pub fn complete(&mut self, info: &BlockInfo) -> Option<BlockRequest> {
        let position = self
            .requests
            .iter()
            .position(|request| request.info == *info)?;
        Some(self.requests.remove(position))
    }

    /// Removes every request whose deadline passed, marked failed so the
    /// scheduler re-queues their blocks.
    pub fn take_expired(&mut self) -> Vec<BlockRequest> {
        let mut expired = vec![];
        let mut position = 0;
        while position < self.requests.len() {
            if self.requests[position].expired() {
                let mut request = self.requests.remove(position);
                request.fail();
                expired.push(request);
            } else {
                position += 1;
            }
        }
        expired
    }

    /// Empties the list on termination, every request marked failed.
    pub fn drain_failed(&mut self) -> Vec<BlockRequest> {
        let mut drained: Vec<BlockRequest> = self.requests.drain(..).collect();
        for request in drained.iter_mut() {
            request.fail();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
