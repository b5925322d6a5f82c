use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::peer::PeerCommand;
use crate::peer_manager::{PeerHandle, PeerManager, PeerManagerError};
use crate::session::{Session, SessionError};
use crate::PeerId;

const CHOKING_WAIT: Duration = Duration::from_secs(10);
const OPTIMISTIC_UNCHOKE_RATE: u64 = 3;
const MAX_UNCHOKED: usize = 4;

/// Posible `Seeder` errors.
#[derive(Debug)]
pub enum SeederError {
    SessionError(SessionError),
    PeerManagerError(PeerManagerError),
}

/// Coordinates the distribution of downloaded pieces to other peers.
///
/// Every 10 seconds the four peers uploading to us fastest (preferring
/// interested ones) are unchoked; every third tick one additional peer is
/// unchoked optimistically to probe for better uploaders.
pub struct Seeder {
    session: Arc<Session>,
    manager: Arc<PeerManager>,
    current_unchoked: HashSet<PeerId>,
    optimistic_unchoke: Option<PeerId>,
}

impl Seeder {
    pub fn new(session: Arc<Session>, manager: Arc<PeerManager>) -> Self {
        Self {
            session,
            manager,
            current_unchoked: HashSet::new(),
            optimistic_unchoke: None,
        }
    }

    pub async fn run(mut self) {
        let mut iteration: u64 = 1;
        let mut tick = interval(CHOKING_WAIT);
        // The first tick of an interval fires immediately.
        tick.tick().await;

        while self.session.is_active() {
            if let Err(err) = self.tick(iteration) {
                warn!("Choking pass failed: {:?}", err);
            }
            iteration += 1;
            tick.tick().await;
        }
    }

    /// One choking pass.
    pub(crate) fn tick(&mut self, iteration: u64) -> Result<(), SeederError> {
        let mut ranked: Vec<(PeerHandle, f64)> = vec![];
        for handle in self
            .manager
            .handles()
            .map_err(SeederError::PeerManagerError)?
        {
            let rate = self
                .session
                .download_rate(&handle.peer_id)
                .map_err(SeederError::SessionError)?;
            ranked.push((handle, rate));
        }
        ranked.sort_by(|left, right| {
            right.1.partial_cmp(&left.1).unwrap_or(CmpOrdering::Equal)
        });

        // Unchoke the peers which upload the most to us and want something
        // back.
        let mut unchoke: HashSet<PeerId> = HashSet::new();
        let mut remaining: Vec<PeerHandle> = vec![];
        for (handle, _) in ranked {
            if unchoke.len() < MAX_UNCHOKED && handle.peer_interested.load(Ordering::Relaxed) {
                unchoke.insert(handle.peer_id);
            } else {
                remaining.push(handle);
            }
        }

        // If fewer than four peers are interested, make up the difference in
        // rank order so four regular slots stay filled.
        let mut leftovers: Vec<PeerId> = vec![];
        for handle in remaining {
            if unchoke.len() < MAX_UNCHOKED {
                unchoke.insert(handle.peer_id);
            } else {
                leftovers.push(handle.peer_id);
            }
        }

        let optimistic = if iteration % OPTIMISTIC_UNCHOKE_RATE == 0 {
            leftovers.into_iter().choose(&mut rand::thread_rng())
        } else {
            self.optimistic_unchoke
        };

        let mut new_set = unchoke.clone();
        if let Some(peer_id) = optimistic {
            new_set.insert(peer_id);
        }
        let mut old_set = self.current_unchoked.clone();
        if let Some(peer_id) = self.optimistic_unchoke {
            old_set.insert(peer_id);
        }

        for peer_id in new_set.difference(&old_set) {
            self.send_choke(peer_id, false)?;
        }
        for peer_id in old_set.difference(&new_set) {
            self.send_choke(peer_id, true)?;
        }

        self.current_unchoked = unchoke;
        self.optimistic_unchoke = optimistic;
        Ok(())
    }

    fn send_choke(&self, peer_id: &PeerId, choking: bool) -> Result<(), SeederError> {
        if let Some(handle) = self
            .manager
            .handle(peer_id)
            .map_err(SeederError::PeerManagerError)?
        {
            if handle
                .commands
                .send(PeerCommand::SetAmChoking(choking))
                .is_err()
            {
                debug!("IP: {} Already terminating", handle.addr);
            }
        }
        Ok(())
    }
}
