use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::message::Bitfield;
use crate::torrent::TorrentDescriptor;

use super::block::{BlockInfo, BlockRequest};
use super::disk;
use super::piece::Piece;

/// What happened to a block handed to `FileStore::add_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was stored (or silently ignored as a duplicate / stale
    /// reply); the piece is still incomplete.
    Progress,
    /// The piece filled up, passed its hash check and is on disk.
    PieceComplete(u32),
    /// The piece filled up but failed its hash check and was reset.
    HashMismatch(u32),
}

/// Posible `FileStore` errors.
#[derive(Debug)]
pub enum FileStoreError {
    InvalidPieceIndex(u32),
    PoisonedPiecesLock,
    IoError(std::io::Error),
}

#[derive(Debug)]
enum PieceSlot {
    Incomplete(Piece),
    Complete,
}

#[derive(Debug)]
struct StoreInner {
    pieces: Vec<PieceSlot>,
    bitfield: Bitfield,
    incomplete: HashSet<u32>,
    completed_bytes: u64,
}

/// Owns the on-disk byte range of the torrent and the per-piece download
/// state. A piece transitions `Incomplete -> Complete` exactly once, only
/// after hash verification, and its buffer is written to disk and released on
/// that transition.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    piece_size: u32,
    total_length: u64,
    piece_count: u32,
    inner: Mutex<StoreInner>,
}

impl FileStore {
    /// Creates the store for a torrent descriptor, truncating the output
    /// file to the full torrent length.
    pub fn new(descriptor: &TorrentDescriptor) -> Result<Self, FileStoreError> {
        disk::allocate_file(&descriptor.output_path, descriptor.total_length)
            .map_err(FileStoreError::IoError)?;

        let piece_count = descriptor.total_pieces();
        let mut pieces = Vec::with_capacity(piece_count as usize);
        for index in 0..piece_count {
            let hash = descriptor
                .piece_hash(index)
                .ok_or(FileStoreError::InvalidPieceIndex(index))?;
            pieces.push(PieceSlot::Incomplete(Piece::new(
                index,
                descriptor.piece_size_of(index),
                *hash,
            )));
        }

        Ok(Self {
            path: descriptor.output_path.clone(),
            piece_size: descriptor.piece_length,
            total_length: descriptor.total_length,
            piece_count,
            inner: Mutex::new(StoreInner {
                pieces,
                bitfield: Bitfield::with_piece_count(piece_count),
                incomplete: (0..piece_count).collect(),
                completed_bytes: 0,
            }),
        })
    }

    /// Applies a fulfilled block request.
    ///
    /// Duplicate and stale blocks are silently absorbed (`Progress`). When a
    /// piece fills up it is hash-checked: on a match it is written to disk at
    /// `index * piece_size` before `PieceComplete` is returned and its buffer
    /// is released; on a mismatch the piece is fully reset.
    pub fn add_block(&self, request: &BlockRequest) -> Result<BlockOutcome, FileStoreError> {
        let mut guard = self.lock_inner()?;
        let inner = &mut *guard;

        let index = request.info.piece;
        let slot = inner
            .pieces
            .get_mut(index as usize)
            .ok_or(FileStoreError::InvalidPieceIndex(index))?;

        let piece = match slot {
            PieceSlot::Complete => return Ok(BlockOutcome::Progress),
            PieceSlot::Incomplete(piece) => piece,
        };

        let data = match &request.data {
            Some(data) => data,
            None => return Ok(BlockOutcome::Progress),
        };

        piece.add_block(&request.info, data);

        if !piece.full() {
            return Ok(BlockOutcome::Progress);
        }

        if !piece.valid_hash() {
            piece.reset();
            return Ok(BlockOutcome::HashMismatch(index));
        }

        let piece_size = piece.data().len() as u64;
        disk::save_piece(
            &self.path,
            piece.data(),
            index as u64 * self.piece_size as u64,
        )
        .map_err(FileStoreError::IoError)?;

        *slot = PieceSlot::Complete;
        inner.bitfield.set_bit(index, true);
        inner.incomplete.remove(&index);
        inner.completed_bytes += piece_size;
        Ok(BlockOutcome::PieceComplete(index))
    }

    /// Resets an incomplete piece: buffer zeroed, block set regenerated.
    pub fn reset(&self, index: u32) -> Result<(), FileStoreError> {
        let mut guard = self.lock_inner()?;
        match guard
            .pieces
            .get_mut(index as usize)
            .ok_or(FileStoreError::InvalidPieceIndex(index))?
        {
            PieceSlot::Incomplete(piece) => piece.reset(),
            PieceSlot::Complete => {}
        }
        Ok(())
    }

    /// Reads a block back from disk. Only complete pieces are served; stale
    /// or out-of-range requests return `None`.
    pub fn read_block(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>, FileStoreError> {
        {
            let guard = self.lock_inner()?;
            match guard.pieces.get(index as usize) {
                Some(PieceSlot::Complete) => {}
                Some(PieceSlot::Incomplete(_)) | None => return Ok(None),
            }
        }

        if begin as u64 + length as u64 > self.piece_size_of(index) as u64 {
            return Ok(None);
        }

        let offset = index as u64 * self.piece_size as u64 + begin as u64;
        let block =
            disk::retrieve_block(&self.path, offset, length as usize).map_err(FileStoreError::IoError)?;
        Ok(Some(block))
    }

    /// Returns the current bitfield of the torrent.
    pub fn bitfield(&self) -> Result<Bitfield, FileStoreError> {
        Ok(self.lock_inner()?.bitfield.clone())
    }

    /// Returns true if every piece is complete and on disk.
    pub fn is_complete(&self) -> Result<bool, FileStoreError> {
        Ok(self.lock_inner()?.incomplete.is_empty())
    }

    /// Returns the indices of the pieces still being downloaded.
    pub fn incomplete_pieces(&self) -> Result<HashSet<u32>, FileStoreError> {
        Ok(self.lock_inner()?.incomplete.clone())
    }

    /// Returns the unfulfilled blocks of a piece; empty for complete pieces.
    pub fn remaining_blocks(&self, index: u32) -> Result<HashSet<BlockInfo>, FileStoreError> {
        let guard = self.lock_inner()?;
        match guard
            .pieces
            .get(index as usize)
            .ok_or(FileStoreError::InvalidPieceIndex(index))?
        {
            PieceSlot::Incomplete(piece) => Ok(piece.remaining_blocks().clone()),
            PieceSlot::Complete => Ok(HashSet::new()),
        }
    }

    /// Returns the amount of bytes not yet verified and written to disk.
    pub fn bytes_left(&self) -> Result<u64, FileStoreError> {
        Ok(self.total_length - self.lock_inner()?.completed_bytes)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Returns the size in bytes of the piece with the given index.
    pub fn piece_size_of(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_size as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_size as u64) as u32
    }

    fn lock_inner(&self) -> Result<MutexGuard<StoreInner>, FileStoreError> {
        self.inner
            .lock()
            .map_err(|_| FileStoreError::PoisonedPiecesLock)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use sha1::{Digest, Sha1};

    use crate::storage::block::BLOCK_SIZE;

    use super::*;

    #[test]
    fn test_new_store_allocates_the_file() {
        let (store, descriptor) = create_test_store("test_store_allocates", &[vec![0u8; 1000]]);

        assert_eq!(
            fs::metadata(&descriptor.output_path).unwrap().len(),
            1000
        );
        assert!(!store.is_complete().unwrap());
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_piece_completion_writes_to_disk() {
        let content = create_test_content(1000, 3);
        let (store, descriptor) = create_test_store("test_store_completion", &[content.clone()]);

        let outcome = store
            .add_block(&create_fulfilled_request(0, 0, &content))
            .unwrap();

        assert_eq!(outcome, BlockOutcome::PieceComplete(0));
        assert!(store.is_complete().unwrap());
        assert!(store.bitfield().unwrap().has_piece(0));
        assert_eq!(fs::read(&descriptor.output_path).unwrap(), content);
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_blocks_arriving_out_of_order() {
        let content = create_test_content(BLOCK_SIZE as usize + 4000, 7);
        let (store, descriptor) = create_test_store("test_store_out_of_order", &[content.clone()]);

        let tail = store
            .add_block(&create_fulfilled_request(
                0,
                BLOCK_SIZE,
                &content[BLOCK_SIZE as usize..],
            ))
            .unwrap();
        assert_eq!(tail, BlockOutcome::Progress);

        let head = store
            .add_block(&create_fulfilled_request(
                0,
                0,
                &content[..BLOCK_SIZE as usize],
            ))
            .unwrap();
        assert_eq!(head, BlockOutcome::PieceComplete(0));

        assert_eq!(fs::read(&descriptor.output_path).unwrap(), content);
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_corrupted_block_resets_the_piece() {
        let content = create_test_content(1000, 3);
        let (store, descriptor) = create_test_store("test_store_hash_mismatch", &[content.clone()]);

        let mut corrupted = content.clone();
        corrupted[123] ^= 0xff;
        let outcome = store
            .add_block(&create_fulfilled_request(0, 0, &corrupted))
            .unwrap();

        assert_eq!(outcome, BlockOutcome::HashMismatch(0));
        assert!(!store.is_complete().unwrap());
        assert!(!store.bitfield().unwrap().has_piece(0));
        // The block set regenerated, so the correct data can come again.
        assert_eq!(store.remaining_blocks(0).unwrap().len(), 1);

        let retry = store
            .add_block(&create_fulfilled_request(0, 0, &content))
            .unwrap();
        assert_eq!(retry, BlockOutcome::PieceComplete(0));
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_duplicate_block_after_completion_is_absorbed() {
        let content = create_test_content(1000, 3);
        let (store, descriptor) = create_test_store("test_store_duplicate", &[content.clone()]);

        store
            .add_block(&create_fulfilled_request(0, 0, &content))
            .unwrap();
        let duplicate = store
            .add_block(&create_fulfilled_request(0, 0, &content))
            .unwrap();

        assert_eq!(duplicate, BlockOutcome::Progress);
        assert!(store.is_complete().unwrap());
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_read_block_only_serves_complete_pieces() {
        let content = create_test_content(1000, 3);
        let (store, descriptor) = create_test_store("test_store_read_block", &[content.clone()]);

        assert!(store.read_block(0, 0, 100).unwrap().is_none());

        store
            .add_block(&create_fulfilled_request(0, 0, &content))
            .unwrap();

        let block = store.read_block(0, 100, 100).unwrap().unwrap();
        assert_eq!(block, &content[100..200]);

        // Past the end of the piece.
        assert!(store.read_block(0, 950, 100).unwrap().is_none());
        remove_test_file(&descriptor);
    }

    #[test]
    fn test_bytes_left_shrinks_with_completed_pieces() {
        let first = create_test_content(1000, 1);
        let second = create_test_content(600, 2);
        let (store, descriptor) =
            create_test_store("test_store_bytes_left", &[first.clone(), second]);

        assert_eq!(store.bytes_left().unwrap(), 1600);

        store
            .add_block(&create_fulfilled_request(0, 0, &first))
            .unwrap();

        assert_eq!(store.bytes_left().unwrap(), 600);
        assert_eq!(store.incomplete_pieces().unwrap(), HashSet::from([1]));
        remove_test_file(&descriptor);
    }

    // Auxiliary functions

    fn create_test_content(length: usize, seed: u8) -> Vec<u8> {
        (0..length)
            .map(|offset| (offset as u8).wrapping_mul(seed).wrapping_add(seed))
            .collect()
    }

    // Builds a descriptor whose pieces are the given contents (all but the
    // last must share one length) and a store on a temp file.
    fn create_test_store(name: &str, pieces: &[Vec<u8>]) -> (FileStore, TorrentDescriptor) {
        let piece_length = pieces[0].len() as u32;
        let total_length: u64 = pieces.iter().map(|piece| piece.len() as u64).sum();
        let hashes = pieces
            .iter()
            .map(|piece| Sha1::digest(piece).into())
            .collect();

        let descriptor = TorrentDescriptor::new(
            [1; 20],
            piece_length,
            total_length,
            hashes,
            PathBuf::from(std::env::temp_dir().join(format!("storrent_{}", name))),
        )
        .unwrap();

        let store = FileStore::new(&descriptor).unwrap();
        (store, descriptor)
    }

    fn remove_test_file(descriptor: &TorrentDescriptor) {
        let _ = fs::remove_file(&descriptor.output_path);
    }

    fn create_fulfilled_request(piece: u32, begin: u32, data: &[u8]) -> BlockRequest {
        let mut request = BlockRequest::new(BlockInfo {
            piece,
            begin,
            length: data.len() as u32,
        });
        request.fulfill(data.to_vec(), [9; 20]);
        request
    }
}
