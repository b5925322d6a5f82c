use std::path::PathBuf;

use crate::Sha1Hash;

/// An already-validated torrent descriptor: everything the swarm engine needs
/// to know about the single file it downloads and serves.
///
/// Metainfo parsing lives outside the engine; whoever parses the `.torrent`
/// file builds one of these with `TorrentDescriptor::new`.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    pub info_hash: Sha1Hash,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<Sha1Hash>,
    pub output_path: PathBuf,
}

/// Posible `TorrentDescriptor` validation errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FromDescriptorError {
    EmptyFile,
    InvalidPieceLength,
    PieceHashCountMismatch { expected: u32, found: usize },
}

impl TorrentDescriptor {
    /// Validates the descriptor fields against each other.
    ///
    /// It returns an error if:
    /// - The total length or the piece length is zero.
    /// - The number of piece hashes does not cover the total length.
    pub fn new(
        info_hash: Sha1Hash,
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<Sha1Hash>,
        output_path: PathBuf,
    ) -> Result<Self, FromDescriptorError> {
        if total_length == 0 {
            return Err(FromDescriptorError::EmptyFile);
        }
        if piece_length == 0 {
            return Err(FromDescriptorError::InvalidPieceLength);
        }

        let expected = ((total_length + piece_length as u64 - 1) / piece_length as u64) as u32;
        if piece_hashes.len() != expected as usize {
            return Err(FromDescriptorError::PieceHashCountMismatch {
                expected,
                found: piece_hashes.len(),
            });
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
            output_path,
        })
    }

    /// Returns the total amount of pieces of the torrent.
    pub fn total_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Returns the size in bytes of the piece with the given index.
    ///
    /// Every piece is `piece_length` bytes except the last one, which covers
    /// whatever remains of the file.
    pub fn piece_size_of(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    /// Returns the size in bytes of the last piece.
    pub fn last_piece_size(&self) -> u32 {
        self.piece_size_of(self.total_pieces() - 1)
    }

    /// Returns the expected SHA-1 hash for the piece with the given index.
    pub fn piece_hash(&self, index: u32) -> Option<&Sha1Hash> {
        self.piece_hashes.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_sizes() {
        let descriptor = create_test_descriptor(3, 32768, 70000);

        assert_eq!(descriptor.total_pieces(), 3);
        assert_eq!(descriptor.piece_size_of(0), 32768);
        assert_eq!(descriptor.piece_size_of(1), 32768);
        assert_eq!(descriptor.piece_size_of(2), 4464);
        assert_eq!(descriptor.last_piece_size(), 4464);
    }

    #[test]
    fn test_exact_multiple_last_piece_is_full_sized() {
        let descriptor = create_test_descriptor(2, 32768, 65536);

        assert_eq!(descriptor.last_piece_size(), 32768);
    }

    #[test]
    fn test_hash_count_mismatch() {
        let result = TorrentDescriptor::new(
            [0; 20],
            32768,
            70000,
            vec![[0; 20]; 2],
            PathBuf::from("./downloads/file"),
        );

        assert_eq!(
            result.unwrap_err(),
            FromDescriptorError::PieceHashCountMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn test_zero_length_file() {
        let result = TorrentDescriptor::new(
            [0; 20],
            32768,
            0,
            vec![],
            PathBuf::from("./downloads/file"),
        );

        assert_eq!(result.unwrap_err(), FromDescriptorError::EmptyFile);
    }

    // Auxiliary functions

    fn create_test_descriptor(pieces: usize, piece_length: u32, total_length: u64) -> TorrentDescriptor {
        TorrentDescriptor::new(
            [1; 20],
            piece_length,
            total_length,
            vec![[0; 20]; pieces],
            PathBuf::from("./downloads/file"),
        )
        .unwrap()
    }
}
