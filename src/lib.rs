pub mod config;
pub mod downloader;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod seeder;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

use rand::Rng;

/// The peer ID is an arbitrary 20 byte string.
///
/// Ours follows the Azureus-style convention: a fixed client prefix followed
/// by random ASCII digits.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

const PEER_ID_PREFIX: &[u8; 8] = b"-OH0001-";

/// Generates a fresh local peer ID: the client prefix plus 12 random digits.
pub fn generate_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_peer_id_has_client_prefix() {
        let peer_id = generate_peer_id();

        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn test_generated_peer_id_tail_is_ascii_digits() {
        let peer_id = generate_peer_id();

        assert!(peer_id[8..].iter().all(|byte| byte.is_ascii_digit()));
    }
}
