use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::message::Bitfield;
use crate::PeerId;

use super::piece_tracker::PieceTracker;
use super::rate::RollingRate;

/// Posible `Session` errors.
#[derive(Debug)]
pub enum SessionError {
    PoisonedSessionLock,
}

#[derive(Debug)]
struct SessionInner {
    // Maps piece index -> peers that own it.
    piece_owners: HashMap<u32, HashSet<PeerId>>,
    // Maps peer -> pieces it owns.
    owned_pieces: HashMap<PeerId, HashSet<u32>>,
    piece_tracker: PieceTracker,
    // Peers that currently have us unchoked.
    peers_unchoking: HashSet<PeerId>,
    // Peers owning at least one piece we still need.
    interesting: HashSet<PeerId>,
    download_rates: HashMap<PeerId, RollingRate>,
    // Pieces we have not completed locally yet.
    incomplete_pieces: HashSet<u32>,
}

/// The process-wide shared view of the swarm.
///
/// It is mutated by every peer session and read by the downloader and the
/// seeder, so all the interesting state lives behind a single lock with one
/// critical section per public method; the lock is never held across I/O.
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionInner>,
    active: AtomicBool,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl Session {
    /// Creates the session for a torrent with the given number of pieces.
    /// The swarm starts inactive; the orchestrator flips it on.
    pub fn new(piece_count: u32) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                piece_owners: (0..piece_count).map(|piece| (piece, HashSet::new())).collect(),
                owned_pieces: HashMap::new(),
                piece_tracker: PieceTracker::new(piece_count),
                peers_unchoking: HashSet::new(),
                interesting: HashSet::new(),
                download_rates: HashMap::new(),
                incomplete_pieces: (0..piece_count).collect(),
            }),
            active: AtomicBool::new(false),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flips the swarm on or off. Turning it off makes every loop exit at
    /// its next awaitable.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Registers a freshly connected peer.
    pub fn add_peer(&self, peer_id: PeerId) -> Result<(), SessionError> {
        let mut inner = self.lock_inner()?;
        inner.owned_pieces.entry(peer_id).or_default();
        inner.download_rates.entry(peer_id).or_insert_with(RollingRate::new);
        Ok(())
    }

    /// Removes every trace of a terminated peer: both ownership indices, the
    /// rarity of each piece it owned, its rate meter and its membership in
    /// the unchoking/interesting sets.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Result<(), SessionError> {
        let mut guard = self.lock_inner()?;
        let inner = &mut *guard;

        if let Some(owned) = inner.owned_pieces.remove(peer_id) {
            for piece in owned {
                if let Some(owners) = inner.piece_owners.get_mut(&piece) {
                    if owners.remove(peer_id) {
                        let rarity = inner.piece_tracker.rarity(piece);
                        inner.piece_tracker.update(piece, rarity.saturating_sub(1));
                    }
                }
            }
        }
        inner.download_rates.remove(peer_id);
        inner.interesting.remove(peer_id);
        inner.peers_unchoking.remove(peer_id);
        Ok(())
    }

    /// Records that a peer owns a piece, bumping its rarity. The peer becomes
    /// interesting if we still need the piece.
    pub fn add_piece_owner(&self, peer_id: PeerId, piece: u32) -> Result<(), SessionError> {
        let mut guard = self.lock_inner()?;
        let inner = &mut *guard;

        inner.owned_pieces.entry(peer_id).or_default().insert(piece);
        if inner.piece_owners.entry(piece).or_default().insert(peer_id) {
            let rarity = inner.piece_tracker.rarity(piece);
            inner.piece_tracker.update(piece, rarity + 1);
        }
        if inner.incomplete_pieces.contains(&piece) {
            inner.interesting.insert(peer_id);
        }
        Ok(())
    }

    /// Records every piece announced in a peer's bitfield.
    pub fn register_bitfield(&self, peer_id: PeerId, bitfield: &Bitfield) -> Result<(), SessionError> {
        for piece in bitfield.piece_indices() {
            self.add_piece_owner(peer_id, piece)?;
        }
        Ok(())
    }

    /// Updates whether the peer is choking us.
    pub fn set_peer_choking(&self, peer_id: &PeerId, choking: bool) -> Result<(), SessionError> {
        let mut inner = self.lock_inner()?;
        if choking {
            inner.peers_unchoking.remove(peer_id);
        } else {
            inner.peers_unchoking.insert(*peer_id);
        }
        Ok(())
    }

    /// Marks a piece locally complete and recomputes which peers are still
    /// interesting (own at least one piece we need).
    pub fn record_completed_piece(&self, piece: u32) -> Result<(), SessionError> {
        let mut guard = self.lock_inner()?;
        let inner = &mut *guard;

        inner.incomplete_pieces.remove(&piece);
        let incomplete = &inner.incomplete_pieces;
        inner.interesting = inner
            .owned_pieces
            .iter()
            .filter(|(_, owned)| owned.iter().any(|piece| incomplete.contains(piece)))
            .map(|(peer_id, _)| *peer_id)
            .collect();
        Ok(())
    }

    pub fn is_peer_interesting(&self, peer_id: &PeerId) -> Result<bool, SessionError> {
        Ok(self.lock_inner()?.interesting.contains(peer_id))
    }

    /// Returns the peers we can currently download from: interesting and not
    /// choking us.
    pub fn interesting_and_unchoking(&self) -> Result<HashSet<PeerId>, SessionError> {
        let inner = self.lock_inner()?;
        Ok(inner
            .interesting
            .intersection(&inner.peers_unchoking)
            .copied()
            .collect())
    }

    /// Returns the rarest piece among the candidates, lowest index on ties.
    pub fn rarest_in(&self, candidates: &HashSet<u32>) -> Result<Option<u32>, SessionError> {
        Ok(self.lock_inner()?.piece_tracker.rarest_in(candidates))
    }

    pub fn owners(&self, piece: u32) -> Result<HashSet<PeerId>, SessionError> {
        Ok(self
            .lock_inner()?
            .piece_owners
            .get(&piece)
            .cloned()
            .unwrap_or_default())
    }

    pub fn owned_pieces(&self, peer_id: &PeerId) -> Result<HashSet<u32>, SessionError> {
        Ok(self
            .lock_inner()?
            .owned_pieces
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Feeds a fulfilled block into the peer's rate meter and the global
    /// downloaded counter.
    pub fn record_downloaded(&self, peer_id: &PeerId, bytes: u64) -> Result<(), SessionError> {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        let mut inner = self.lock_inner()?;
        inner
            .download_rates
            .entry(*peer_id)
            .or_insert_with(RollingRate::new)
            .record(bytes);
        Ok(())
    }

    /// Returns the peer's download rate in bytes per second.
    pub fn download_rate(&self, peer_id: &PeerId) -> Result<f64, SessionError> {
        let mut inner = self.lock_inner()?;
        Ok(inner
            .download_rates
            .get_mut(peer_id)
            .map(|rate| rate.rate())
            .unwrap_or(0.0))
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    fn lock_inner(&self) -> Result<MutexGuard<SessionInner>, SessionError> {
        self.inner
            .lock()
            .map_err(|_| SessionError::PoisonedSessionLock)
    }
}
