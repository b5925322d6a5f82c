pub mod manager;

pub use manager::{PeerHandle, PeerManager, PeerManagerError};
