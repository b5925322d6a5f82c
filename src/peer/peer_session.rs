use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

use crate::message::handshake::HANDSHAKE_LENGTH;
use crate::message::{Handshake, HandshakeError, Message, MessageError, MAX_REQUEST_LENGTH};
use crate::session::{Session, SessionError};
use crate::storage::{BlockInfo, BlockRequest, FileStore, FileStoreError};
use crate::{PeerId, Sha1Hash};

use super::bt_peer::BtPeer;
use super::command::PeerCommand;
use super::pending::PendingRequests;
use super::session_status::SessionStatus;

// Hard cap on a single socket read.
const MAX_BUFFER: usize = 64 * 1024;
// A silent peer is dead after this long without any traffic.
const DEAD_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const HANDSHAKE_WAIT: Duration = Duration::from_secs(15);
const READ_WAIT: Duration = Duration::from_secs(15);
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Posible `PeerSession` errors.
#[derive(Debug)]
pub enum PeerSessionError {
    ErrorReadingMessage(io::Error),
    ErrorWritingMessage(io::Error),
    HandshakeTimeout,
    MalformedHandshake(HandshakeError),
    MalformedMessage(MessageError),
    UnexpectedBitfield,
    InvalidBitfield,
    PeerTimeout,
    ConnectionClosed,
    SessionError(SessionError),
    StoreError(FileStoreError),
}

/// Sends our handshake, validates the remote one and follows up with our
/// bitfield, as an outbound dialler. Returns the remote peer id.
pub async fn handshake_outgoing(
    stream: &mut TcpStream,
    info_hash: &Sha1Hash,
    local_id: &PeerId,
    store: &FileStore,
) -> Result<PeerId, PeerSessionError> {
    let handshake = Handshake::new(*info_hash, *local_id);
    stream
        .write_all(&handshake.as_bytes())
        .await
        .map_err(PeerSessionError::ErrorWritingMessage)?;

    let their_id = read_remote_handshake(stream, info_hash).await?;
    send_local_bitfield(stream, store).await?;
    Ok(their_id)
}

/// Validates the remote handshake first and then replies with ours plus our
/// bitfield, as the accepting side. Returns the remote peer id.
pub async fn handshake_incoming(
    stream: &mut TcpStream,
    info_hash: &Sha1Hash,
    local_id: &PeerId,
    store: &FileStore,
) -> Result<PeerId, PeerSessionError> {
    let their_id = read_remote_handshake(stream, info_hash).await?;

    let handshake = Handshake::new(*info_hash, *local_id);
    stream
        .write_all(&handshake.as_bytes())
        .await
        .map_err(PeerSessionError::ErrorWritingMessage)?;

    send_local_bitfield(stream, store).await?;
    Ok(their_id)
}

async fn read_remote_handshake(
    stream: &mut TcpStream,
    info_hash: &Sha1Hash,
) -> Result<PeerId, PeerSessionError> {
    let mut buffer = [0u8; HANDSHAKE_LENGTH];
    match timeout(HANDSHAKE_WAIT, stream.read_exact(&mut buffer)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(PeerSessionError::ErrorReadingMessage(err)),
        Err(_) => return Err(PeerSessionError::HandshakeTimeout),
    }

    let handshake =
        Handshake::from_bytes(&buffer, info_hash).map_err(PeerSessionError::MalformedHandshake)?;
    Ok(handshake.peer_id)
}

async fn send_local_bitfield(
    stream: &mut TcpStream,
    store: &FileStore,
) -> Result<(), PeerSessionError> {
    let bitfield = store.bitfield().map_err(PeerSessionError::StoreError)?;
    stream
        .write_all(&Message::Bitfield(bitfield).as_bytes())
        .await
        .map_err(PeerSessionError::ErrorWritingMessage)
}

/// A `PeerSession` represents a connection to a peer after the handshake.
///
/// It owns the socket and the pending-request list, runs the protocol state
/// machine, pushes fulfilled and failed requests onto the shared completed
/// queue and obeys commands from the downloader and the seeder.
pub struct PeerSession {
    peer: BtPeer,
    their_id: PeerId,
    session: Arc<Session>,
    store: Arc<FileStore>,
    status: SessionStatus,
    pending: PendingRequests,
    completed_tx: UnboundedSender<BlockRequest>,
    num_pending: Arc<AtomicUsize>,
    peer_interested: Arc<AtomicBool>,
    messages_received: u64,
    last_response: Instant,
}

impl PeerSession {
    pub fn new(
        peer: BtPeer,
        their_id: PeerId,
        session: Arc<Session>,
        store: Arc<FileStore>,
        completed_tx: UnboundedSender<BlockRequest>,
        num_pending: Arc<AtomicUsize>,
        peer_interested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            peer,
            their_id,
            session,
            store,
            status: SessionStatus::new(),
            pending: PendingRequests::new(),
            completed_tx,
            num_pending,
            peer_interested,
            messages_received: 0,
            last_response: Instant::now(),
        }
    }

    /// The main running loop. On any exit path the socket is dropped, every
    /// pending request is flushed as failed and the peer is removed from the
    /// shared session.
    pub async fn run(mut self, stream: TcpStream, mut commands: UnboundedReceiver<PeerCommand>) {
        let (mut reader, mut writer) = stream.into_split();

        match self.run_loop(&mut reader, &mut writer, &mut commands).await {
            Ok(()) => info!("IP: {} Peer session finished", self.peer.addr),
            Err(err) => warn!("IP: {} Peer session ended: {:?}", self.peer.addr, err),
        }

        self.terminate();
    }

    async fn run_loop(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        commands: &mut UnboundedReceiver<PeerCommand>,
    ) -> Result<(), PeerSessionError> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; MAX_BUFFER];
        let mut refresh = interval(REFRESH_INTERVAL);

        while self.session.is_active() {
            tokio::select! {
                read = timeout(READ_WAIT, reader.read(&mut chunk)) => match read {
                    Ok(Ok(0)) => return Err(PeerSessionError::ConnectionClosed),
                    Ok(Ok(bytes_read)) => {
                        self.last_response = Instant::now();
                        buffer.extend_from_slice(&chunk[..bytes_read]);
                        self.drain_messages(&mut buffer, writer).await?;
                    }
                    Ok(Err(err)) => return Err(PeerSessionError::ErrorReadingMessage(err)),
                    Err(_) => {
                        if !self.connection_alive() {
                            return Err(PeerSessionError::PeerTimeout);
                        }
                    }
                },
                command = commands.recv() => match command {
                    Some(PeerCommand::Terminate) | None => return Ok(()),
                    Some(command) => self.handle_command(command, writer).await?,
                },
                _ = refresh.tick() => self.refresh(),
            }
        }
        Ok(())
    }

    // Parses every complete message sitting in the receive buffer.
    async fn drain_messages(
        &mut self,
        buffer: &mut Vec<u8>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerSessionError> {
        loop {
            match Message::parse_first(buffer) {
                Ok((message, consumed)) => {
                    buffer.drain(..consumed);
                    self.handle_message(message, writer).await?;
                    self.messages_received += 1;
                }
                Err(MessageError::Incomplete) => return Ok(()),
                Err(err) => return Err(PeerSessionError::MalformedMessage(err)),
            }
        }
    }

    /// Handles a message received from the peer.
    async fn handle_message(
        &mut self,
        message: Message,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerSessionError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.peer_choking = true;
                self.session
                    .set_peer_choking(&self.their_id, true)
                    .map_err(PeerSessionError::SessionError)?;
            }
            Message::Unchoke => {
                self.status.peer_choking = false;
                self.session
                    .set_peer_choking(&self.their_id, false)
                    .map_err(PeerSessionError::SessionError)?;
            }
            Message::Interested => {
                self.status.peer_interested = true;
                self.peer_interested.store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
                self.peer_interested.store(false, Ordering::Relaxed);
            }
            Message::Have { piece } => {
                self.session
                    .add_piece_owner(self.their_id, piece)
                    .map_err(PeerSessionError::SessionError)?;
                self.reconcile_interest(writer).await?;
            }
            Message::Bitfield(bitfield) => {
                // Only valid as the very first message after the handshake.
                if self.messages_received != 0 {
                    return Err(PeerSessionError::UnexpectedBitfield);
                }
                if !bitfield.valid_for(self.store.piece_count()) {
                    return Err(PeerSessionError::InvalidBitfield);
                }
                self.session
                    .register_bitfield(self.their_id, &bitfield)
                    .map_err(PeerSessionError::SessionError)?;
                self.reconcile_interest(writer).await?;
            }
            Message::Piece {
                piece,
                begin,
                block,
            } => self.handle_piece(piece, begin, block)?,
            Message::Request {
                piece,
                begin,
                length,
            } => self.handle_request(piece, begin, length, writer).await?,
            Message::Cancel { .. } | Message::Port { .. } => {}
        }
        Ok(())
    }

    // A `Piece` reply either fulfills a pending request or is a delayed
    // answer to one that already expired, in which case it is dropped.
    fn handle_piece(
        &mut self,
        piece: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<(), PeerSessionError> {
        let info = BlockInfo {
            piece,
            begin,
            length: block.len() as u32,
        };

        let mut request = match self.pending.complete(&info) {
            Some(request) => request,
            None => {
                debug!("IP: {} Discarding stale block {:?}", self.peer.addr, info);
                return Ok(());
            }
        };

        request.fulfill(block, self.their_id);
        self.num_pending.fetch_sub(1, Ordering::Relaxed);
        self.session
            .record_downloaded(&self.their_id, info.length as u64)
            .map_err(PeerSessionError::SessionError)?;

        if self.completed_tx.send(request).is_err() {
            debug!("IP: {} Completed queue closed", self.peer.addr);
        }
        Ok(())
    }

    // Serves a block to the remote if it is not choked and the request is
    // within bounds; anything else is silently ignored.
    async fn handle_request(
        &mut self,
        piece: u32,
        begin: u32,
        length: u32,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerSessionError> {
        if self.status.am_choking || length > MAX_REQUEST_LENGTH {
            return Ok(());
        }

        let block = match self
            .store
            .read_block(piece, begin, length)
            .map_err(PeerSessionError::StoreError)?
        {
            Some(block) => block,
            None => return Ok(()),
        };

        self.session.add_uploaded(length as u64);
        self.send_message(writer, &Message::Piece {
            piece,
            begin,
            block,
        })
        .await?;
        debug!("IP: {} Sent piece: {} / Offset: {}", self.peer.addr, piece, begin);
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: PeerCommand,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerSessionError> {
        match command {
            PeerCommand::SetAmChoking(choking) => {
                if choking != self.status.am_choking {
                    self.status.am_choking = choking;
                    let message = if choking {
                        Message::Choke
                    } else {
                        Message::Unchoke
                    };
                    self.send_message(writer, &message).await?;
                }
            }
            PeerCommand::SetAmInterested(interested) => {
                if interested != self.status.am_interested {
                    self.status.am_interested = interested;
                    let message = if interested {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    };
                    self.send_message(writer, &message).await?;
                }
            }
            PeerCommand::SendHave(piece) => {
                self.send_message(writer, &Message::Have { piece }).await?;
                // Completing a piece may have made this peer boring.
                self.reconcile_interest(writer).await?;
            }
            PeerCommand::SendRequest(mut request) => {
                request.start();
                self.num_pending.fetch_add(1, Ordering::Relaxed);
                let message = Message::Request {
                    piece: request.info.piece,
                    begin: request.info.begin,
                    length: request.info.length,
                };
                self.pending.push(request);
                self.send_message(writer, &message).await?;
            }
            PeerCommand::SendCancel(info) => {
                self.send_message(writer, &Message::Cancel {
                    piece: info.piece,
                    begin: info.begin,
                    length: info.length,
                })
                .await?;
            }
            PeerCommand::Terminate => {}
        }
        Ok(())
    }

    // Keeps `am_interested` in sync with whether the peer still owns pieces
    // we need, announcing changes on the wire.
    async fn reconcile_interest(
        &mut self,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerSessionError> {
        let interesting = self
            .session
            .is_peer_interesting(&self.their_id)
            .map_err(PeerSessionError::SessionError)?;

        if interesting != self.status.am_interested {
            self.status.am_interested = interesting;
            let message = if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send_message(writer, &message).await?;
        }
        Ok(())
    }

    // Recycles requests the remote never answered.
    fn refresh(&mut self) {
        for request in self.pending.take_expired() {
            debug!("IP: {} Request expired: {:?}", self.peer.addr, request.info);
            self.num_pending.fetch_sub(1, Ordering::Relaxed);
            if self.completed_tx.send(request).is_err() {
                return;
            }
        }
    }

    fn terminate(&mut self) {
        for request in self.pending.drain_failed() {
            self.num_pending.fetch_sub(1, Ordering::Relaxed);
            if self.completed_tx.send(request).is_err() {
                break;
            }
        }
        if self.session.remove_peer(&self.their_id).is_err() {
            warn!("IP: {} Could not clean up session state", self.peer.addr);
        }
    }

    fn connection_alive(&self) -> bool {
        Instant::now() - self.last_response < DEAD_TIMEOUT
    }

    async fn send_message(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &Message,
    ) -> Result<(), PeerSessionError> {
        writer
            .write_all(&message.as_bytes())
            .await
            .map_err(PeerSessionError::ErrorWritingMessage)
    }
}
