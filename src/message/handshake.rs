use crate::{PeerId, Sha1Hash};

/// Posible `Handshake` parsing errors. Any deviation from the expected 68
/// bytes is treated the same way: the connection is dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    MalformedHandshake,
}

pub const HANDSHAKE_LENGTH: usize = 68;

const PSTR: &str = "BitTorrent protocol";
const PSTRLEN: u8 = 19;

/// Represents a handshake message.
/// Is the first message sent to start a connection with a peer.
#[derive(Debug)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new `Handshake` message.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// Converts a `Handshake` message to a byte array.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![PSTRLEN];
        bytes.extend(PSTR.as_bytes());
        bytes.extend([0u8; 8]);
        bytes.extend(&self.info_hash);
        bytes.extend(&self.peer_id);
        bytes
    }

    /// Parses a byte array into a `Handshake` message, checking the remote
    /// torrent against the locally expected info hash.
    ///
    /// It returns an error if:
    /// - The buffer is not exactly 68 bytes long.
    /// - The protocol string or its length byte do not match.
    /// - The announced info hash is not the expected one.
    pub fn from_bytes(
        bytes: &[u8],
        expected_info_hash: &Sha1Hash,
    ) -> Result<Self, HandshakeError> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(HandshakeError::MalformedHandshake);
        }

        if bytes[0] != PSTRLEN {
            return Err(HandshakeError::MalformedHandshake);
        }

        if &bytes[1..20] != PSTR.as_bytes() {
            return Err(HandshakeError::MalformedHandshake);
        }

        let mut info_hash: Sha1Hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        if &info_hash != expected_info_hash {
            return Err(HandshakeError::MalformedHandshake);
        }

        let mut peer_id: PeerId = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}
