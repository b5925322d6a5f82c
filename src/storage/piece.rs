use std::collections::HashSet;

use sha1::{Digest, Sha1};

use crate::Sha1Hash;

use super::block::{BlockInfo, BLOCK_SIZE};

/// An in-flight piece: a buffer being filled block by block, plus the set of
/// blocks still missing.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    total_size: u32,
    current_size: u32,
    sha1: Sha1Hash,
    data: Vec<u8>,
    remaining_blocks: HashSet<BlockInfo>,
}

impl Piece {
    pub fn new(index: u32, total_size: u32, sha1: Sha1Hash) -> Self {
        let mut piece = Self {
            index,
            total_size,
            current_size: 0,
            sha1,
            data: vec![0; total_size as usize],
            remaining_blocks: HashSet::new(),
        };
        piece.generate_requests();
        piece
    }

    // Divide the piece into 16 KiB aligned blocks, the last possibly shorter.
    fn generate_requests(&mut self) {
        for begin in (0..self.total_size).step_by(BLOCK_SIZE as usize) {
            self.remaining_blocks.insert(BlockInfo {
                piece: self.index,
                begin,
                length: BLOCK_SIZE.min(self.total_size - begin),
            });
        }
    }

    /// Fills the buffer region of the given block.
    ///
    /// Returns whether the block was accepted. Blocks that are not in the
    /// remaining set (duplicates, stale replies, bad offsets) are ignored, as
    /// are blocks whose data does not match the announced length.
    pub fn add_block(&mut self, info: &BlockInfo, data: &[u8]) -> bool {
        if data.len() != info.length as usize || !self.remaining_blocks.remove(info) {
            return false;
        }

        let begin = info.begin as usize;
        self.data[begin..begin + data.len()].copy_from_slice(data);
        self.current_size += info.length;
        true
    }

    pub fn full(&self) -> bool {
        self.current_size == self.total_size
    }

    pub fn valid_hash(&self) -> bool {
        let hash = Sha1::digest(&self.data);
        hash.as_slice() == self.sha1
    }

    /// Clears the piece after a failed hash check: buffer zeroed, block set
    /// regenerated.
    pub fn reset(&mut self) {
        self.data = vec![0; self.total_size as usize];
        self.remaining_blocks.clear();
        self.current_size = 0;
        self.generate_requests();
    }

    pub fn remaining_blocks(&self) -> &HashSet<BlockInfo> {
        &self.remaining_blocks
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn current_size(&self) -> u32 {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_partition_the_piece() {
        let piece = Piece::new(0, BLOCK_SIZE * 2 + 4000, [0; 20]);

        let mut blocks: Vec<BlockInfo> = piece.remaining_blocks().iter().copied().collect();
        blocks.sort();

        assert_eq!(
            blocks,
            vec![
                create_block(0, BLOCK_SIZE),
                create_block(BLOCK_SIZE, BLOCK_SIZE),
                create_block(BLOCK_SIZE * 2, 4000),
            ]
        );
    }

    #[test]
    fn test_small_piece_is_one_short_block() {
        let piece = Piece::new(0, 1000, [0; 20]);

        assert_eq!(piece.remaining_blocks().len(), 1);
        assert!(piece.remaining_blocks().contains(&create_block(0, 1000)));
    }

    #[test]
    fn test_any_fill_order_completes_the_piece() {
        let content: Vec<u8> = (0..BLOCK_SIZE * 2 + 4000).map(|i| (i % 251) as u8).collect();
        let hash = Sha1::digest(&content);

        let orders: [[u32; 3]; 3] = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];
        for order in orders {
            let mut piece = Piece::new(0, content.len() as u32, hash.into());
            let blocks: Vec<BlockInfo> = {
                let mut blocks: Vec<BlockInfo> =
                    piece.remaining_blocks().iter().copied().collect();
                blocks.sort();
                blocks
            };

            for position in order {
                let block = blocks[position as usize];
                let begin = block.begin as usize;
                assert!(piece.add_block(&block, &content[begin..begin + block.length as usize]));
            }

            assert!(piece.full());
            assert!(piece.valid_hash());
        }
    }

    #[test]
    fn test_duplicate_block_is_a_no_op() {
        let mut piece = Piece::new(0, 1000, [0; 20]);
        let block = create_block(0, 1000);

        assert!(piece.add_block(&block, &[1; 1000]));
        assert!(!piece.add_block(&block, &[2; 1000]));

        assert_eq!(piece.current_size(), 1000);
        assert_eq!(piece.data()[0], 1);
    }

    #[test]
    fn test_block_with_wrong_length_is_ignored() {
        let mut piece = Piece::new(0, 1000, [0; 20]);
        let block = create_block(0, 1000);

        assert!(!piece.add_block(&block, &[1; 999]));
        assert_eq!(piece.current_size(), 0);
    }

    #[test]
    fn test_unknown_block_is_ignored() {
        let mut piece = Piece::new(0, BLOCK_SIZE * 2, [0; 20]);

        assert!(!piece.add_block(&create_block(100, 200), &[1; 200]));
        assert_eq!(piece.current_size(), 0);
    }

    #[test]
    fn test_corrupted_piece_fails_the_hash_check() {
        let content = vec![7u8; 1000];
        let hash = Sha1::digest(&content);
        let mut piece = Piece::new(0, 1000, hash.into());

        let mut corrupted = content;
        corrupted[500] ^= 0xff;
        piece.add_block(&create_block(0, 1000), &corrupted);

        assert!(piece.full());
        assert!(!piece.valid_hash());
    }

    #[test]
    fn test_reset_regenerates_the_block_set() {
        let mut piece = Piece::new(0, 1000, [0; 20]);
        piece.add_block(&create_block(0, 1000), &[1; 1000]);
        assert!(piece.full());

        piece.reset();

        assert_eq!(piece.current_size(), 0);
        assert_eq!(piece.remaining_blocks().len(), 1);
        assert!(piece.data().iter().all(|byte| *byte == 0));
    }

    // Auxiliary functions

    fn create_block(begin: u32, length: u32) -> BlockInfo {
        BlockInfo {
            piece: 0,
            begin,
            length,
        }
    }
}
