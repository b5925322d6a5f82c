use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::peer::PeerCommand;
use crate::peer_manager::{PeerHandle, PeerManager, PeerManagerError};
use crate::session::{Session, SessionError};
use crate::storage::{BlockInfo, BlockOutcome, BlockRequest, FileStore, FileStoreError};
use crate::PeerId;

/// How many requests a peer may have on the wire at once.
pub const MAX_PEER_REQUESTS: usize = 5;

// With this few incomplete pieces left the scheduler doubles requests up.
pub const ENDGAME_PIECE_THRESHOLD: usize = 3;

const PEER_WAIT: Duration = Duration::from_secs(3);
const MAX_PEER_WAIT: Duration = Duration::from_secs(100);
const NO_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Posible `Downloader` errors.
#[derive(Debug)]
pub enum DownloaderError {
    SessionError(SessionError),
    StoreError(FileStoreError),
    PeerManagerError(PeerManagerError),
}

/// Why the download loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every piece verified and on disk.
    Complete,
    /// Nobody interesting unchoked us for too long.
    NoPeers,
    /// The swarm was shut down externally.
    Stopped,
}

/// The request scheduler: consumes completed block requests, assigns pieces
/// to peers rarest-first, keeps every available peer's pipeline full and
/// punishes the contributors of corrupt pieces.
pub struct Downloader {
    session: Arc<Session>,
    store: Arc<FileStore>,
    manager: Arc<PeerManager>,
    completed_requests: UnboundedReceiver<BlockRequest>,
    // Maps peer -> the piece it is currently drawing blocks from.
    assigned_pieces: HashMap<PeerId, u32>,
    // Maps piece -> blocks already handed to some peer.
    assigned_requests: HashMap<u32, HashSet<BlockInfo>>,
    // Maps block -> peers it was requested from, for endgame cancels.
    requested_from: HashMap<BlockInfo, HashSet<PeerId>>,
    // Maps piece -> peers that contributed blocks to it.
    piece_contributors: HashMap<u32, HashSet<PeerId>>,
    endgame: bool,
}

impl Downloader {
    pub fn new(
        session: Arc<Session>,
        store: Arc<FileStore>,
        manager: Arc<PeerManager>,
        completed_requests: UnboundedReceiver<BlockRequest>,
    ) -> Self {
        Self {
            session,
            store,
            manager,
            completed_requests,
            assigned_pieces: HashMap::new(),
            assigned_requests: HashMap::new(),
            requested_from: HashMap::new(),
            piece_contributors: HashMap::new(),
            endgame: false,
        }
    }

    /// The main scheduling loop. Returns when the file is complete, when no
    /// peer has been available for too long, or when the swarm is stopped.
    pub async fn run(mut self) -> Result<DownloadOutcome, DownloaderError> {
        while self.session.is_active() {
            if !self.have_available_peers()? {
                if !self.wait_for_peers().await? {
                    info!("No peers available, stopping the download");
                    return Ok(DownloadOutcome::NoPeers);
                }
                if !self.session.is_active() {
                    break;
                }
            }

            self.update_endgame()?;
            self.distribute_requests()?;

            match timeout(NO_REQUEST_TIMEOUT, self.completed_requests.recv()).await {
                Ok(Some(request)) => {
                    self.handle_request(request)?;
                    if self
                        .store
                        .is_complete()
                        .map_err(DownloaderError::StoreError)?
                    {
                        info!("Download complete");
                        return Ok(DownloadOutcome::Complete);
                    }
                }
                // Every sender dropped: the swarm is tearing down.
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        Ok(DownloadOutcome::Stopped)
    }

    // We can download from peers that have pieces we want and are not
    // ignoring our requests.
    fn have_available_peers(&self) -> Result<bool, DownloaderError> {
        Ok(!self
            .session
            .interesting_and_unchoking()
            .map_err(DownloaderError::SessionError)?
            .is_empty())
    }

    // Sleeps in small steps until some peer becomes available; gives up
    // after `MAX_PEER_WAIT`.
    async fn wait_for_peers(&self) -> Result<bool, DownloaderError> {
        let mut waited = Duration::ZERO;

        while self.session.is_active() {
            if self.manager.peer_count() > 0 && self.have_available_peers()? {
                return Ok(true);
            }
            if waited > MAX_PEER_WAIT {
                return Ok(false);
            }
            sleep(PEER_WAIT).await;
            waited += PEER_WAIT;
        }
        Ok(true)
    }

    fn update_endgame(&mut self) -> Result<(), DownloaderError> {
        if self.endgame {
            return Ok(());
        }
        let incomplete = self
            .store
            .incomplete_pieces()
            .map_err(DownloaderError::StoreError)?;
        if !incomplete.is_empty() && incomplete.len() <= ENDGAME_PIECE_THRESHOLD {
            info!("Entering endgame with {} pieces left", incomplete.len());
            self.endgame = true;
        }
        Ok(())
    }

    /// Tops up the pipeline of every available peer.
    pub(crate) fn distribute_requests(&mut self) -> Result<(), DownloaderError> {
        let available = self
            .session
            .interesting_and_unchoking()
            .map_err(DownloaderError::SessionError)?;

        for peer_id in available {
            if let Some(handle) = self
                .manager
                .handle(&peer_id)
                .map_err(DownloaderError::PeerManagerError)?
            {
                self.issue_requests(&handle)?;
            }
        }
        Ok(())
    }

    fn issue_requests(&mut self, handle: &PeerHandle) -> Result<(), DownloaderError> {
        let capacity =
            MAX_PEER_REQUESTS.saturating_sub(handle.num_pending.load(Ordering::Relaxed));
        if capacity == 0 {
            return Ok(());
        }

        let piece = match self.useful_assigned_piece(&handle.peer_id)? {
            Some(piece) => piece,
            None => match self.assign_piece(&handle.peer_id)? {
                Some(piece) => piece,
                None => return Ok(()),
            },
        };

        let remaining = self
            .store
            .remaining_blocks(piece)
            .map_err(DownloaderError::StoreError)?;
        if remaining.is_empty() {
            return Ok(());
        }

        let already_assigned = self.assigned_requests.entry(piece).or_default();
        let unsent: HashSet<BlockInfo> =
            remaining.difference(already_assigned).copied().collect();

        // When every block of the piece is already on the wire to someone,
        // or in endgame, double up so the piece finishes as fast as
        // possible.
        let pool: Vec<BlockInfo> = if unsent.is_empty() || self.endgame {
            remaining.iter().copied().collect()
        } else {
            unsent.into_iter().collect()
        };

        let sample_size = capacity.min(pool.len());
        let sampled = pool
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), sample_size);

        for info in sampled {
            let request = BlockRequest::new(info);
            if handle
                .commands
                .send(PeerCommand::SendRequest(request))
                .is_err()
            {
                debug!("IP: {} Dropped commands mid-distribution", handle.addr);
                return Ok(());
            }
            self.assigned_requests.entry(piece).or_default().insert(info);
            self.requested_from
                .entry(info)
                .or_default()
                .insert(handle.peer_id);
        }
        Ok(())
    }

    // The piece currently assigned to the peer, unless it finished (or was
    // never assigned one).
    fn useful_assigned_piece(&self, peer_id: &PeerId) -> Result<Option<u32>, DownloaderError> {
        match self.assigned_pieces.get(peer_id) {
            Some(piece) => {
                let remaining = self
                    .store
                    .remaining_blocks(*piece)
                    .map_err(DownloaderError::StoreError)?;
                Ok(if remaining.is_empty() {
                    None
                } else {
                    Some(*piece)
                })
            }
            None => Ok(None),
        }
    }

    // Picks the rarest piece this peer can give us, preferring pieces no
    // other peer is assigned to.
    pub(crate) fn assign_piece(&mut self, peer_id: &PeerId) -> Result<Option<u32>, DownloaderError> {
        let incomplete = self
            .store
            .incomplete_pieces()
            .map_err(DownloaderError::StoreError)?;
        let owned = self
            .session
            .owned_pieces(peer_id)
            .map_err(DownloaderError::SessionError)?;

        let mut candidates: HashSet<u32> = incomplete.intersection(&owned).copied().collect();
        if candidates.is_empty() {
            self.assigned_pieces.remove(peer_id);
            return Ok(None);
        }

        let taken: HashSet<u32> = self.assigned_pieces.values().copied().collect();
        let unassigned: HashSet<u32> = candidates.difference(&taken).copied().collect();
        if !unassigned.is_empty() {
            candidates = unassigned;
        }
        // Else just have to double up.

        let piece = self
            .session
            .rarest_in(&candidates)
            .map_err(DownloaderError::SessionError)?;
        if let Some(piece) = piece {
            self.assigned_pieces.insert(*peer_id, piece);
        }
        Ok(piece)
    }

    /// Applies one reply from the completed-requests queue.
    pub(crate) fn handle_request(&mut self, request: BlockRequest) -> Result<(), DownloaderError> {
        if !request.successful {
            // Expired or flushed by a dying peer: free the assignment so the
            // block is drawn again on the next distribute pass.
            if let Some(assigned) = self.assigned_requests.get_mut(&request.info.piece) {
                assigned.remove(&request.info);
            }
            return Ok(());
        }

        if let Some(completed_by) = request.completed_by {
            self.piece_contributors
                .entry(request.info.piece)
                .or_default()
                .insert(completed_by);
        }
        self.cancel_duplicates(&request)?;

        match self
            .store
            .add_block(&request)
            .map_err(DownloaderError::StoreError)?
        {
            BlockOutcome::Progress => {}
            BlockOutcome::PieceComplete(piece) => self.finish_piece(piece)?,
            BlockOutcome::HashMismatch(piece) => self.punish_contributors(piece)?,
        }
        Ok(())
    }

    // First fulfilled reply for a block wins; everyone else who was asked
    // for it in endgame gets a cancel.
    fn cancel_duplicates(&mut self, request: &BlockRequest) -> Result<(), DownloaderError> {
        let mut asked = match self.requested_from.remove(&request.info) {
            Some(asked) => asked,
            None => return Ok(()),
        };
        if let Some(completed_by) = request.completed_by {
            asked.remove(&completed_by);
        }

        for peer_id in asked {
            if let Some(handle) = self
                .manager
                .handle(&peer_id)
                .map_err(DownloaderError::PeerManagerError)?
            {
                if handle
                    .commands
                    .send(PeerCommand::SendCancel(request.info))
                    .is_err()
                {
                    debug!("IP: {} Dropped commands before cancel", handle.addr);
                }
            }
        }
        Ok(())
    }

    fn finish_piece(&mut self, piece: u32) -> Result<(), DownloaderError> {
        self.manager
            .broadcast_have(piece)
            .map_err(DownloaderError::PeerManagerError)?;
        self.session
            .record_completed_piece(piece)
            .map_err(DownloaderError::SessionError)?;

        self.piece_contributors.remove(&piece);
        self.assigned_requests.remove(&piece);
        self.requested_from.retain(|info, _| info.piece != piece);
        self.assigned_pieces.retain(|_, assigned| *assigned != piece);

        let total = self.store.piece_count();
        let left = self
            .store
            .incomplete_pieces()
            .map_err(DownloaderError::StoreError)?
            .len();
        info!(
            "Piece {} downloaded! ({} / {} pieces)",
            piece,
            total as usize - left,
            total
        );
        Ok(())
    }

    // The only plausible source of a corrupt piece is a peer injecting bad
    // blocks, so everyone who contributed gets banned and disconnected.
    fn punish_contributors(&mut self, piece: u32) -> Result<(), DownloaderError> {
        warn!("Piece {} failed its hash check", piece);

        for contributor in self.piece_contributors.remove(&piece).unwrap_or_default() {
            if let Some(handle) = self
                .manager
                .handle(&contributor)
                .map_err(DownloaderError::PeerManagerError)?
            {
                self.manager
                    .blacklist_peer(handle.addr)
                    .map_err(DownloaderError::PeerManagerError)?;
                self.manager
                    .terminate(&contributor)
                    .map_err(DownloaderError::PeerManagerError)?;
            }
        }

        self.assigned_requests.remove(&piece);
        self.requested_from.retain(|info, _| info.piece != piece);
        Ok(())
    }
}
