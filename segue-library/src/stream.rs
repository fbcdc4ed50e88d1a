//! Live stream feeding for radio decks
//!
//! A feeder thread pushes decoded audio into a deck's ring buffer at roughly
//! real-time pace. The deck reads whatever is buffered and plays silence when
//! the feeder falls behind.

use crate::loader::TrackLoader;
use segue_audio::{LiveStream, LoadError, StreamProducer, TrackAudio};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Ring buffer length for live decks
const BUFFER_SECONDS: f64 = 2.0;

/// Frames pushed per write
const PUSH_FRAMES: usize = 1024;

/// Background thread writing PCM into a live stream
pub struct StreamFeeder {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamFeeder {
    /// Decode `path` and feed it on repeat into a new live stream
    pub fn open(path: &Path, loader: &TrackLoader) -> Result<(StreamFeeder, TrackAudio), LoadError> {
        let decoded = loader.load(path)?;
        let sample_rate = decoded.sample_rate;
        let capacity = (BUFFER_SECONDS * sample_rate as f64) as usize;
        let (producer, stream) = LiveStream::with_capacity(capacity, sample_rate);
        let feeder = Self::spawn(Arc::new(decoded.samples), producer, sample_rate)?;
        Ok((feeder, TrackAudio::Stream(stream)))
    }

    /// Start feeding `samples` (interleaved stereo) into `producer` in a loop
    pub fn spawn(samples: Arc<Vec<f32>>, mut producer: StreamProducer, sample_rate: u32) -> Result<Self, LoadError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        // Sleep for roughly half a push worth of audio when the buffer is full
        let idle = Duration::from_secs_f64(PUSH_FRAMES as f64 / sample_rate.max(1) as f64 / 2.0);

        let handle = std::thread::Builder::new()
            .name("segue-stream-feeder".into())
            .spawn(move || {
                if samples.is_empty() {
                    return;
                }
                let mut pos = 0usize;
                while flag.load(Ordering::Relaxed) {
                    let want = (PUSH_FRAMES * 2).min(samples.len() - pos);
                    if producer.vacant() < want {
                        std::thread::sleep(idle);
                        continue;
                    }
                    let pushed = producer.push(&samples[pos..pos + want]);
                    pos = (pos + pushed) % samples.len();
                }
                tracing::debug!("stream feeder stopped");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("stream feeder panicked");
            }
        }
    }
}

impl Drop for StreamFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}
