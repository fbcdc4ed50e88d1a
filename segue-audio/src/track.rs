//! Track model - content types, capabilities and deck audio sources

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Deck identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeckId {
    A,
    B,
}

impl DeckId {
    /// The other deck
    pub fn other(self) -> DeckId {
        match self {
            DeckId::A => DeckId::B,
            DeckId::B => DeckId::A,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            DeckId::A => 0,
            DeckId::B => 1,
        }
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeckId::A => write!(f, "A"),
            DeckId::B => write!(f, "B"),
        }
    }
}

/// Kind of content loaded on a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Short loop with a known length
    Loop,
    /// Complete song with a known length
    #[default]
    FullSong,
    /// Live stream without a deterministic duration
    RadioStream,
}

/// What a content type allows, resolved once at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_duration: bool,
    pub supports_section_loop: bool,
    pub is_live: bool,
}

impl ContentType {
    pub fn capabilities(self) -> Capabilities {
        match self {
            ContentType::Loop | ContentType::FullSong => Capabilities {
                has_duration: true,
                supports_section_loop: true,
                is_live: false,
            },
            ContentType::RadioStream => Capabilities {
                has_duration: false,
                supports_section_loop: false,
                is_live: true,
            },
        }
    }
}

/// Track description supplied by the track source collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Opaque reference understood by the track source (path, URL, id)
    pub source_ref: String,
    /// Declared tempo; `None` when unknown
    pub bpm: Option<f64>,
    /// Length in seconds; derived from the decoded audio when absent
    pub duration_secs: Option<f64>,
    pub content_type: ContentType,
}

impl Track {
    pub fn new(source_ref: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            source_ref: source_ref.into(),
            bpm: None,
            duration_secs: None,
            content_type,
        }
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = Some(bpm);
        self
    }
}

/// Errors that can occur while opening a track
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("No audio track found in source")]
    NoAudioTrack,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("sample rate {actual} Hz does not match engine rate {expected} Hz")]
    SampleRate { expected: u32, actual: u32 },
    #[error("{content:?} content cannot be played from {audio} audio")]
    ContentMismatch {
        content: ContentType,
        audio: &'static str,
    },
}

/// Decoded audio held in memory (interleaved stereo)
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
}

impl PcmBuffer {
    /// Wrap interleaved stereo samples
    pub fn new(samples: Arc<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Consumer side of a live stream (interleaved stereo)
pub struct LiveStream {
    consumer: HeapCons<f32>,
    sample_rate: u32,
}

impl LiveStream {
    /// Create a live stream with room for `capacity_frames` frames.
    ///
    /// Returns the producer half for whoever feeds the stream.
    pub fn with_capacity(capacity_frames: usize, sample_rate: u32) -> (StreamProducer, Self) {
        let rb = HeapRb::<f32>::new(capacity_frames.max(1) * 2);
        let (producer, consumer) = rb.split();
        (
            StreamProducer { producer },
            Self {
                consumer,
                sample_rate,
            },
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Pop up to `out.len()` samples; returns how many were written
    pub(crate) fn read(&mut self, out: &mut [f32]) -> usize {
        // keep frames whole
        let wanted = out.len() & !1;
        let available = self.consumer.occupied_len() & !1;
        let n = wanted.min(available);
        self.consumer.pop_slice(&mut out[..n])
    }
}

impl fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStream")
            .field("sample_rate", &self.sample_rate)
            .field("buffered", &self.consumer.occupied_len())
            .finish()
    }
}

/// Producer side of a live stream
pub struct StreamProducer {
    producer: HeapProd<f32>,
}

impl StreamProducer {
    /// Push interleaved stereo samples; returns how many were accepted
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Free space in samples
    pub fn vacant(&self) -> usize {
        self.producer.vacant_len()
    }
}

/// Audio behind a loaded deck
#[derive(Debug)]
pub enum TrackAudio {
    Buffer(PcmBuffer),
    Stream(LiveStream),
}

impl TrackAudio {
    pub fn sample_rate(&self) -> u32 {
        match self {
            TrackAudio::Buffer(b) => b.sample_rate(),
            TrackAudio::Stream(s) => s.sample_rate(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TrackAudio::Buffer(_) => "buffered",
            TrackAudio::Stream(_) => "streamed",
        }
    }
}

/// Collaborator that turns a track description into playable audio
pub trait TrackSource {
    fn open(&self, track: &Track) -> Result<TrackAudio, LoadError>;
}
