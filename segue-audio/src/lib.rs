//! Mixing engine for Segue - two decks, a crossfader and a bar-exact recorder
//!
//! This crate provides the core pipeline:
//! - Section: bar and 8-bar section arithmetic
//! - Deck: transport, section loops and nudge for one track
//! - Mixer: crossfader curves and the mix bus
//! - Sync: beat phase alignment between decks
//! - Recorder: fixed-length capture of the mix bus with tail
//! - Engine: the composition root that runs each tick

mod deck;
mod engine;
mod error;
mod mixer;
mod recorder;
mod scheduler;
pub mod section;
mod sync;
mod track;

pub use deck::{Deck, DeckSnapshot, LoopRegion, PlaybackState};
pub use engine::{EngineCommand, EngineConfig, EngineEvent, EngineHandle, EngineSnapshot, MixEngine};
pub use error::{MixError, MixResult};
pub use mixer::{Crossfader, CrossfaderCurve, MixBus};
pub use recorder::{
    FinishedAsset, PendingRecording, RecorderSnapshot, RecordingOutcome, RecordingResult,
    RecordingStatus, StopOutcome,
};
pub use scheduler::{ScheduledTask, Scheduler, TaskHandle};
pub use sync::{phase_error, SyncDisableReason, SyncEngine, SyncState, SyncStatus};
pub use track::{
    Capabilities, ContentType, DeckId, LiveStream, LoadError, PcmBuffer, StreamProducer, Track,
    TrackAudio, TrackSource,
};
