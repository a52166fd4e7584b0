//! Downloads lossless tracks from Tidal, Amazon Music, Qobuz and Deezer for
//! a Spotify track, names them predictably and tags them.

pub mod config;
pub mod cover;
pub mod downloader;
pub mod error;
pub mod genre;
pub mod helpers;
pub mod linking;
pub mod lyrics;
pub mod metadata;
pub mod processor;
pub mod queue;
pub mod request;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use downloader::Downloader;
pub use error::{Error, Result};
pub use queue::{MemoryQueue, QueueSink};
pub use request::{DownloadOutcome, TrackRequest};
