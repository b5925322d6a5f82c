pub mod block;
pub mod disk;
pub mod piece;
pub mod store;

pub use block::{BlockInfo, BlockRequest, BLOCK_SIZE};
pub use piece::Piece;
pub use store::{BlockOutcome, FileStore, FileStoreError};
