//! Track sources and settings for Segue - decoding, live streams, config

mod config;
mod loader;
mod stream;

pub use config::{Config, ConfigError, LibraryConfig};
pub use loader::{DecodedTrack, FileTrackSource, TrackLoader, TrackMetadata};
pub use stream::StreamFeeder;
