use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::config::cfg::Cfg;
use crate::peer::{handshake_incoming, handshake_outgoing, BtPeer, PeerCommand, PeerSession};
use crate::session::Session;
use crate::storage::{BlockRequest, FileStore};
use crate::{PeerId, Sha1Hash};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Posible `PeerManager` errors.
#[derive(Debug)]
pub enum PeerManagerError {
    PoisonedPeersLock,
    PoisonedBlacklistLock,
    PoisonedConnectedLock,
    OpeningListenerError(io::Error),
    BlacklistFileError(io::Error),
}

/// The shared view other components hold of one running peer session: the
/// command channel plus the counters the scheduler and the seeder read.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub addr: SocketAddrV4,
    pub commands: UnboundedSender<PeerCommand>,
    pub num_pending: Arc<AtomicUsize>,
    pub peer_interested: Arc<AtomicBool>,
}

/// Owns the population of connected peers: dials announced addresses,
/// accepts inbound connections, enforces the connection cap and the
/// blacklist, and keeps the handle registry other components use to send
/// commands. The shared `Session` only ever sees peer ids.
#[derive(Debug)]
pub struct PeerManager {
    local_id: PeerId,
    info_hash: Sha1Hash,
    session: Arc<Session>,
    store: Arc<FileStore>,
    completed_tx: UnboundedSender<BlockRequest>,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    blacklist: Mutex<HashSet<SocketAddrV4>>,
    connected_addrs: Mutex<HashSet<SocketAddrV4>>,
    peer_count: AtomicUsize,
    max_peers: usize,
}

impl PeerManager {
    /// Creates the manager, seeding the blacklist from the configured file
    /// when one is set (one `ip:port` per line).
    pub fn new(
        local_id: PeerId,
        info_hash: Sha1Hash,
        session: Arc<Session>,
        store: Arc<FileStore>,
        completed_tx: UnboundedSender<BlockRequest>,
        config: &Cfg,
    ) -> Result<Self, PeerManagerError> {
        let blacklist = match &config.blacklist_file {
            Some(path) => Self::load_blacklist(path)?,
            None => HashSet::new(),
        };

        Ok(Self {
            local_id,
            info_hash,
            session,
            store,
            completed_tx,
            peers: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(blacklist),
            connected_addrs: Mutex::new(HashSet::new()),
            peer_count: AtomicUsize::new(0),
            max_peers: config.max_peers as usize,
        })
    }

    fn load_blacklist(path: &str) -> Result<HashSet<SocketAddrV4>, PeerManagerError> {
        let file = File::open(path).map_err(PeerManagerError::BlacklistFileError)?;
        let reader = BufReader::new(file);

        let mut blacklist = HashSet::new();
        for line in reader.lines() {
            let line = line.map_err(PeerManagerError::BlacklistFileError)?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<SocketAddrV4>() {
                Ok(addr) => {
                    blacklist.insert(addr);
                }
                Err(_) => warn!("Ignoring malformed blacklist entry: {}", line),
            }
        }
        Ok(blacklist)
    }

    /// Binds the listening socket on the first free port of the configured
    /// range.
    pub async fn bind_listener(config: &Cfg) -> Result<TcpListener, PeerManagerError> {
        let mut last_error = io::Error::new(io::ErrorKind::AddrInUse, "no ports in range");
        for port in config.listen_port_start..=config.listen_port_end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    info!("Listening for peers on port {}", port);
                    return Ok(listener);
                }
                Err(err) => last_error = err,
            }
        }
        Err(PeerManagerError::OpeningListenerError(last_error))
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of every connected peer's handle.
    pub fn handles(&self) -> Result<Vec<PeerHandle>, PeerManagerError> {
        Ok(self.lock_peers()?.values().cloned().collect())
    }

    pub fn handle(&self, peer_id: &PeerId) -> Result<Option<PeerHandle>, PeerManagerError> {
        Ok(self.lock_peers()?.get(peer_id).cloned())
    }

    pub fn is_blacklisted(&self, addr: &SocketAddrV4) -> Result<bool, PeerManagerError> {
        Ok(self.lock_blacklist()?.contains(addr))
    }

    /// Bans an address for the rest of the swarm's life.
    pub fn blacklist_peer(&self, addr: SocketAddrV4) -> Result<(), PeerManagerError> {
        warn!("IP: {} Blacklisted", addr);
        self.lock_blacklist()?.insert(addr);
        Ok(())
    }

    /// Asks a peer session to shut down.
    pub fn terminate(&self, peer_id: &PeerId) -> Result<(), PeerManagerError> {
        if let Some(handle) = self.lock_peers()?.get(peer_id) {
            if handle.commands.send(PeerCommand::Terminate).is_err() {
                debug!("IP: {} Already terminating", handle.addr);
            }
        }
        Ok(())
    }

    /// Asks every connected peer session to shut down.
    pub fn terminate_all(&self) -> Result<(), PeerManagerError> {
        for handle in self.lock_peers()?.values() {
            if handle.commands.send(PeerCommand::Terminate).is_err() {
                debug!("IP: {} Already terminating", handle.addr);
            }
        }
        Ok(())
    }

    /// Tells every connected peer we now own a piece.
    pub fn broadcast_have(&self, piece: u32) -> Result<(), PeerManagerError> {
        for handle in self.lock_peers()?.values() {
            if handle.commands.send(PeerCommand::SendHave(piece)).is_err() {
                debug!("IP: {} Already terminating", handle.addr);
            }
        }
        Ok(())
    }

    /// Dials every announced address in parallel, skipping banned, already
    /// connected and over-cap entries.
    pub fn connect_to_peers(self: &Arc<Self>, addrs: Vec<SocketAddrV4>) {
        for addr in addrs {
            if self.peer_count() >= self.max_peers {
                return;
            }
            let skip = match self.is_blacklisted(&addr) {
                Ok(blacklisted) => blacklisted || self.is_connected(&addr),
                Err(_) => true,
            };
            if skip {
                continue;
            }

            let manager = self.clone();
            tokio::spawn(async move {
                manager.dial(addr).await;
            });
        }
    }

    // Outbound connection attempt. Addresses that fail to connect or to
    // handshake are banned so the next announce does not retry them.
    async fn dial(self: Arc<Self>, addr: SocketAddrV4) {
        let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("IP: {} Could not connect: {}", addr, err);
                self.ban_failed_dial(addr);
                return;
            }
            Err(_) => {
                debug!("IP: {} Connection timed out", addr);
                self.ban_failed_dial(addr);
                return;
            }
        };

        match handshake_outgoing(&mut stream, &self.info_hash, &self.local_id, &self.store).await {
            Ok(their_id) => {
                info!("IP: {} Handshake successful", addr);
                self.register_and_run(stream, addr, their_id);
            }
            Err(err) => {
                warn!("IP: {} Handshake failed: {:?}", addr, err);
                self.ban_failed_dial(addr);
            }
        }
    }

    fn ban_failed_dial(&self, addr: SocketAddrV4) {
        if self.blacklist_peer(addr).is_err() {
            warn!("IP: {} Could not blacklist", addr);
        }
    }

    /// Accept loop for the listening socket. Checks the cap and the
    /// blacklist before spending a handshake on the connection.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        let mut poll = interval(ACCEPT_POLL);
        while self.session.is_active() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.clone().handle_incoming(stream, addr).await,
                    Err(err) => warn!("Could not accept connection: {}", err),
                },
                _ = poll.tick() => {}
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, mut stream: TcpStream, addr: std::net::SocketAddr) {
        let addr = match addr {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => return,
        };

        if self.peer_count() >= self.max_peers {
            debug!("IP: {} Rejected, max peers reached", addr);
            return;
        }
        if self.is_blacklisted(&addr).unwrap_or(true) {
            debug!("IP: {} Rejected, blacklisted", addr);
            return;
        }

        match handshake_incoming(&mut stream, &self.info_hash, &self.local_id, &self.store).await {
            Ok(their_id) => {
                info!("IP: {} Handshake successful", addr);
                self.register_and_run(stream, addr, their_id);
            }
            Err(err) => warn!("IP: {} Handshake failed: {:?}", addr, err),
        }
    }

    // Registers the peer in the session and the handle registry, then spawns
    // its session task. The task cleans the registry up when it ends.
    fn register_and_run(self: Arc<Self>, stream: TcpStream, addr: SocketAddrV4, their_id: PeerId) {
        if their_id == self.local_id {
            debug!("IP: {} Connected to ourself, dropping", addr);
            return;
        }

        let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
        let num_pending = Arc::new(AtomicUsize::new(0));
        let peer_interested = Arc::new(AtomicBool::new(false));
        let handle = PeerHandle {
            peer_id: their_id,
            addr,
            commands: command_tx,
            num_pending: num_pending.clone(),
            peer_interested: peer_interested.clone(),
        };

        if self.insert_handle(handle).unwrap_or(false) {
            let peer_session = PeerSession::new(
                BtPeer::with_id(addr, their_id),
                their_id,
                self.session.clone(),
                self.store.clone(),
                self.completed_tx.clone(),
                num_pending,
                peer_interested,
            );

            let manager = self.clone();
            tokio::spawn(async move {
                peer_session.run(stream, command_rx).await;
                manager.remove_handle(&their_id, &addr);
            });
        } else {
            debug!("IP: {} Duplicate connection, dropping", addr);
        }
    }

    // Returns false when the peer id is already connected.
    pub(crate) fn insert_handle(&self, handle: PeerHandle) -> Result<bool, PeerManagerError> {
        if self.session.add_peer(handle.peer_id).is_err() {
            return Ok(false);
        }

        let mut peers = self.lock_peers()?;
        if peers.contains_key(&handle.peer_id) {
            return Ok(false);
        }
        self.lock_connected()?.insert(handle.addr);
        self.peer_count.fetch_add(1, Ordering::Relaxed);
        peers.insert(handle.peer_id, handle);
        Ok(true)
    }

    fn remove_handle(&self, peer_id: &PeerId, addr: &SocketAddrV4) {
        if let Ok(mut peers) = self.lock_peers() {
            peers.remove(peer_id);
        }
        if let Ok(mut connected) = self.lock_connected() {
            connected.remove(addr);
        }
        self.peer_count.fetch_sub(1, Ordering::Relaxed);
        info!("IP: {} Peer disconnected", addr);
    }

    fn is_connected(&self, addr: &SocketAddrV4) -> bool {
        match self.lock_connected() {
            Ok(connected) => connected.contains(addr),
            Err(_) => true,
        }
    }

    fn lock_peers(&self) -> Result<MutexGuard<HashMap<PeerId, PeerHandle>>, PeerManagerError> {
        self.peers
            .lock()
            .map_err(|_| PeerManagerError::PoisonedPeersLock)
    }

    fn lock_blacklist(&self) -> Result<MutexGuard<HashSet<SocketAddrV4>>, PeerManagerError> {
        self.blacklist
            .lock()
            .map_err(|_| PeerManagerError::PoisonedBlacklistLock)
    }

    fn lock_connected(&self) -> Result<MutexGuard<HashSet<SocketAddrV4>>, PeerManagerError> {
        self.connected_addrs
            .lock()
            .map_err(|_| PeerManagerError::PoisonedConnectedLock)
    }
}
