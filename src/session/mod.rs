pub mod piece_tracker;
pub mod rate;
pub mod session;

pub use piece_tracker::PieceTracker;
pub use rate::RollingRate;
pub use session::{Session, SessionError};
