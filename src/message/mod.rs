pub mod bitfield;
pub mod handshake;
pub mod message;

pub use bitfield::Bitfield;
pub use handshake::{Handshake, HandshakeError};
pub use message::{Message, MessageError, MAX_REQUEST_LENGTH};
