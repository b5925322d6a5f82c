pub mod announcer;

pub use announcer::{Announce, AnnounceError, AnnounceEvent, Announcer, TransferStats};
