pub mod downloader;

pub use downloader::{DownloadOutcome, Downloader, DownloaderError, MAX_PEER_REQUESTS};
