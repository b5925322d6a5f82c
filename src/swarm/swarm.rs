use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::cfg::Cfg;
use crate::downloader::{DownloadOutcome, Downloader, DownloaderError};
use crate::generate_peer_id;
use crate::peer_manager::{PeerManager, PeerManagerError};
use crate::seeder::Seeder;
use crate::session::Session;
use crate::storage::{FileStore, FileStoreError};
use crate::torrent::TorrentDescriptor;
use crate::tracker::{AnnounceError, AnnounceEvent, Announcer, TransferStats};

// Consecutive announce failures tolerated before giving up on the swarm.
const ANNOUNCE_FAILURE_LIMIT: u32 = 3;

/// Posible `Swarm` errors.
#[derive(Debug)]
pub enum SwarmError {
    StoreError(FileStoreError),
    PeerManagerError(PeerManagerError),
    DownloaderError(DownloaderError),
    AnnounceError(AnnounceError),
}

/// The orchestrator: wires the store, the shared session, the peer
/// population, the request scheduler and the choking loop together and
/// drives the whole swarm from `Started` to `Stopped`.
pub struct Swarm {
    descriptor: TorrentDescriptor,
    config: Cfg,
    announcer: Arc<dyn Announcer>,
}

impl Swarm {
    pub fn new(descriptor: TorrentDescriptor, config: Cfg, announcer: Arc<dyn Announcer>) -> Self {
        Self {
            descriptor,
            config,
            announcer,
        }
    }

    /// Runs the swarm until the download completes, no peers are left or the
    /// tracker becomes unreachable. Completed pieces are served to other
    /// peers the whole time.
    pub async fn run(self) -> Result<DownloadOutcome, SwarmError> {
        let local_id = generate_peer_id();
        let store =
            Arc::new(FileStore::new(&self.descriptor).map_err(SwarmError::StoreError)?);
        let session = Arc::new(Session::new(self.descriptor.total_pieces()));
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(
            PeerManager::new(
                local_id,
                self.descriptor.info_hash,
                session.clone(),
                store.clone(),
                completed_tx,
                &self.config,
            )
            .map_err(SwarmError::PeerManagerError)?,
        );

        let listener = PeerManager::bind_listener(&self.config)
            .await
            .map_err(SwarmError::PeerManagerError)?;
        session.set_active(true);

        let announce = self
            .announcer
            .announce(AnnounceEvent::Started, &transfer_stats(&session, &store))
            .map_err(SwarmError::AnnounceError)?;
        info!("Announced start, received {} peers", announce.peers.len());
        manager.connect_to_peers(announce.peer_addrs());

        let listener_task = tokio::spawn(manager.clone().listen(listener));
        let seeder_task = tokio::spawn(Seeder::new(session.clone(), manager.clone()).run());
        let announce_task = tokio::spawn(announce_loop(
            self.announcer.clone(),
            session.clone(),
            store.clone(),
            manager.clone(),
            announce.interval,
        ));

        let downloader = Downloader::new(
            session.clone(),
            store.clone(),
            manager.clone(),
            completed_rx,
        );
        let outcome = downloader.run().await.map_err(SwarmError::DownloaderError);

        if matches!(outcome, Ok(DownloadOutcome::Complete)) {
            if let Err(err) = self
                .announcer
                .announce(AnnounceEvent::Completed, &transfer_stats(&session, &store))
            {
                warn!("Completed announce failed: {:?}", err);
            }
        }

        // Wind everything down: every loop checks the active flag at its
        // next awaitable, peer tasks flush their pending requests as failed.
        session.set_active(false);
        announce_task.abort();
        seeder_task.abort();
        listener_task.abort();
        if let Err(err) = manager.terminate_all() {
            warn!("Could not terminate peers: {:?}", err);
        }

        if let Err(err) = self
            .announcer
            .announce(AnnounceEvent::Stopped, &transfer_stats(&session, &store))
        {
            warn!("Stopped announce failed: {:?}", err);
        }

        info!("Swarm stopped: {:?}", outcome);
        outcome
    }
}

// Re-announces on the tracker's interval, feeding fresh peers to the
// manager. Gives up on the whole swarm after too many failures in a row.
async fn announce_loop(
    announcer: Arc<dyn Announcer>,
    session: Arc<Session>,
    store: Arc<FileStore>,
    manager: Arc<PeerManager>,
    initial_interval: u32,
) {
    let mut interval_secs = initial_interval.max(1);
    let mut failures = 0u32;

    loop {
        sleep(Duration::from_secs(interval_secs as u64)).await;
        if !session.is_active() {
            return;
        }

        match announcer.announce(AnnounceEvent::None, &transfer_stats(&session, &store)) {
            Ok(announce) => {
                failures = 0;
                interval_secs = announce.interval.max(1);
                manager.connect_to_peers(announce.peer_addrs());
            }
            Err(err) => {
                failures += 1;
                warn!("Announce failed ({} in a row): {:?}", failures, err);
                if failures >= ANNOUNCE_FAILURE_LIMIT {
                    warn!("Tracker unreachable, stopping the swarm");
                    session.set_active(false);
                    return;
                }
            }
        }
    }
}

fn transfer_stats(session: &Session, store: &FileStore) -> TransferStats {
    TransferStats {
        uploaded: session.uploaded(),
        downloaded: session.downloaded(),
        left: store.bytes_left().unwrap_or_else(|_| store.total_length()),
    }
}
