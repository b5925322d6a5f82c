pub mod descriptor;

pub use descriptor::{FromDescriptorError, TorrentDescriptor};
