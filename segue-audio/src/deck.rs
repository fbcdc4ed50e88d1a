//! Deck implementation - transport and section-loop playback for one track

use crate::error::{MixError, MixResult};
use crate::section::{self, BARS_PER_SECTION};
use crate::track::{Capabilities, ContentType, DeckId, LoadError, Track, TrackAudio, TrackSource};
use serde::Serialize;

/// Playback state for a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Inclusive range of 8-bar sections the deck wraps around in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopRegion {
    pub start_section: u32,
    pub end_section: u32,
}

impl LoopRegion {
    /// First bar covered by the region
    pub fn start_bar(&self) -> u32 {
        self.start_section * BARS_PER_SECTION
    }

    /// Bar right after the region
    pub fn end_bar(&self) -> u32 {
        (self.end_section + 1) * BARS_PER_SECTION
    }
}

/// Deck state for UI rendering
#[derive(Debug, Clone, Serialize)]
pub struct DeckSnapshot {
    pub id: DeckId,
    pub playback: PlaybackState,
    pub position: f64,              // seconds
    pub duration: Option<f64>,      // seconds, None for live streams
    pub bpm: Option<f64>,
    pub gain: f32,
    pub source_ref: Option<String>,
    pub content_type: Option<ContentType>,
    pub loop_region: Option<LoopRegion>,
    pub loop_bounds: Option<(f64, f64)>, // seconds, nudge applied
    pub nudge_bars: f64,
    pub peak_level: f32,
}

/// A single deck
pub struct Deck {
    id: DeckId,
    /// Engine sample rate; loaded audio must match it
    sample_rate: u32,
    /// Loaded track with its duration resolved
    track: Option<Track>,
    audio: Option<TrackAudio>,
    capabilities: Option<Capabilities>,
    /// Playback position in frames
    position: f64,
    state: PlaybackState,
    /// Tempo used for section math and sync (metadata only)
    bpm: Option<f64>,
    /// Gain set by the crossfader for the current block
    gain: f32,
    /// Gain at the end of the previous block (ramp start)
    prev_gain: f32,
    loop_region: Option<LoopRegion>,
    /// Loop bounds in frames, recomputed whenever region, nudge or bpm change
    loop_frames: Option<(f64, f64)>,
    /// Section boundary offset in bars
    nudge_bars: f64,
    peak_level: f32,
}

impl Deck {
    /// Create a new empty deck
    pub fn new(id: DeckId, sample_rate: u32) -> Self {
        Self {
            id,
            sample_rate,
            track: None,
            audio: None,
            capabilities: None,
            position: 0.0,
            state: PlaybackState::Stopped,
            bpm: None,
            gain: 1.0,
            prev_gain: 1.0,
            loop_region: None,
            loop_frames: None,
            nudge_bars: 0.0,
            peak_level: 0.0,
        }
    }

    pub fn id(&self) -> DeckId {
        self.id
    }

    /// Open `track` through `source` and swap it in.
    ///
    /// Nothing on the deck changes unless the whole load succeeds.
    pub fn load(&mut self, track: Track, source: &dyn TrackSource) -> MixResult<()> {
        let audio = source.open(&track)?;
        self.attach(track, audio)
    }

    /// Swap in audio that was opened elsewhere (e.g. on a control thread)
    pub fn attach(&mut self, mut track: Track, audio: TrackAudio) -> MixResult<()> {
        if audio.sample_rate() != self.sample_rate {
            return Err(LoadError::SampleRate {
                expected: self.sample_rate,
                actual: audio.sample_rate(),
            }
            .into());
        }

        let caps = track.content_type.capabilities();
        match (&audio, caps.is_live) {
            (TrackAudio::Buffer(buf), false) => {
                let decoded = buf.duration_secs();
                track.duration_secs = match track.duration_secs {
                    None => Some(decoded),
                    Some(d) if d.is_finite() && d > 0.0 => Some(d.min(decoded)),
                    Some(d) => {
                        return Err(MixError::invalid(format!("track duration must be positive, got {d}")));
                    }
                };
            }
            (TrackAudio::Stream(_), true) => track.duration_secs = None,
            _ => {
                return Err(LoadError::ContentMismatch {
                    content: track.content_type,
                    audio: audio.kind(),
                }
                .into())
            }
        }
        if let Some(bpm) = track.bpm {
            if !(bpm.is_finite() && bpm > 0.0) {
                return Err(MixError::invalid(format!("track BPM must be positive, got {bpm}")));
            }
        }

        tracing::info!(deck = %self.id, source = %track.source_ref, content = ?track.content_type, "track loaded");

        self.bpm = track.bpm;
        self.capabilities = Some(caps);
        self.track = Some(track);
        self.audio = Some(audio);
        self.position = 0.0;
        self.state = PlaybackState::Stopped;
        self.loop_region = None;
        self.loop_frames = None;
        self.peak_level = 0.0;
        Ok(())
    }

    /// Check if deck has a track loaded
    pub fn is_loaded(&self) -> bool {
        self.audio.is_some()
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Start playback
    pub fn play(&mut self) {
        if self.is_loaded() {
            self.state = PlaybackState::Playing;
        }
    }

    /// Pause playback
    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
    }

    /// Stop playback, rewind and drop the loop region
    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.position = 0.0;
        self.loop_region = None;
        self.loop_frames = None;
    }

    pub fn playback(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// Set playback position in seconds (ignored for live streams)
    pub fn seek(&mut self, position_secs: f64) {
        if self.is_live() {
            return;
        }
        if !position_secs.is_finite() {
            return;
        }
        let max = (self.duration().unwrap_or(0.0) * self.sample_rate as f64).max(0.0);
        self.position = (position_secs * self.sample_rate as f64).clamp(0.0, max);
    }

    /// Shift the position by `delta_secs`; used by the sync engine
    pub(crate) fn nudge_position(&mut self, delta_secs: f64) {
        if self.is_live() {
            tracing::debug!(deck = %self.id, "cannot nudge a live stream");
            return;
        }
        let current = self.position_secs();
        self.seek(current + delta_secs);
    }

    /// Update the tempo used for section math and sync.
    ///
    /// This never touches the audio: no resampling, no time-stretch.
    pub fn set_bpm(&mut self, bpm: f64) -> MixResult<()> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(MixError::invalid(format!("BPM must be positive, got {bpm}")));
        }
        self.bpm = Some(bpm);
        self.refresh_loop_frames();
        Ok(())
    }

    pub fn bpm(&self) -> Option<f64> {
        self.bpm
    }

    /// Loop playback over sections `start_section..=end_section`
    pub fn set_loop_region(&mut self, start_section: i64, end_section: i64) -> MixResult<()> {
        let caps = self
            .capabilities
            .ok_or_else(|| MixError::invalid("no track loaded"))?;
        if !caps.supports_section_loop {
            return Err(MixError::invalid("section loops are not supported for radio streams"));
        }
        let bpm = self
            .bpm
            .ok_or_else(|| MixError::invalid("deck has no BPM for section math"))?;
        let duration = self
            .duration()
            .ok_or_else(|| MixError::invalid("track has no known duration"))?;

        for index in [start_section, end_section] {
            if !section::is_valid_section(index, duration, bpm) {
                return Err(MixError::invalid(format!(
                    "section {index} is out of range (track has {})",
                    section::total_sections(duration, bpm)
                )));
            }
        }
        if start_section > end_section {
            return Err(MixError::invalid(format!(
                "loop start {start_section} is after loop end {end_section}"
            )));
        }

        self.loop_region = Some(LoopRegion {
            start_section: start_section as u32,
            end_section: end_section as u32,
        });
        self.refresh_loop_frames();

        // Jump into the region if playback is outside it
        if let Some((start, end)) = self.loop_frames {
            if self.position < start || self.position >= end {
                self.position = start;
            }
        }
        tracing::debug!(deck = %self.id, start_section, end_section, "loop region set");
        Ok(())
    }

    /// Return to normal playback
    pub fn clear_loop_region(&mut self) {
        self.loop_region = None;
        self.loop_frames = None;
    }

    pub fn loop_region(&self) -> Option<LoopRegion> {
        self.loop_region
    }

    /// Shift section boundaries by a fractional number of bars
    pub fn set_nudge_bars(&mut self, nudge_bars: f64) -> MixResult<()> {
        if !nudge_bars.is_finite() {
            return Err(MixError::invalid("nudge must be finite"));
        }
        self.nudge_bars = nudge_bars;
        self.refresh_loop_frames();
        Ok(())
    }

    pub fn nudge_bars(&self) -> f64 {
        self.nudge_bars
    }

    /// Loop bounds in seconds, nudge applied
    pub fn loop_bounds(&self) -> Option<(f64, f64)> {
        let sr = self.sample_rate as f64;
        self.loop_frames.map(|(s, e)| (s / sr, e / sr))
    }

    fn refresh_loop_frames(&mut self) {
        let (Some(region), Some(bpm), Some(duration)) = (self.loop_region, self.bpm, self.duration())
        else {
            self.loop_frames = None;
            return;
        };
        let start = section::section_time_range(region.start_section, bpm, self.nudge_bars).start;
        let end = section::section_time_range(region.end_section, bpm, self.nudge_bars).end;
        let start = start.clamp(0.0, duration);
        let end = end.min(duration);
        let sr = self.sample_rate as f64;
        self.loop_frames = if end > start {
            Some((start * sr, end * sr))
        } else {
            None
        };
    }

    /// Written by the crossfader only
    pub(crate) fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Track duration in seconds; `None` for live streams or an empty deck
    pub fn duration(&self) -> Option<f64> {
        self.track.as_ref().and_then(|t| t.duration_secs)
    }

    /// Current position in seconds
    pub fn position_secs(&self) -> f64 {
        self.position / self.sample_rate as f64
    }

    fn is_live(&self) -> bool {
        self.capabilities.map_or(false, |c| c.is_live)
    }

    /// Get deck state for UI
    pub fn snapshot(&self) -> DeckSnapshot {
        DeckSnapshot {
            id: self.id,
            playback: self.state,
            position: self.position_secs(),
            duration: self.duration(),
            bpm: self.bpm,
            gain: self.gain,
            source_ref: self.track.as_ref().map(|t| t.source_ref.clone()),
            content_type: self.track.as_ref().map(|t| t.content_type),
            loop_region: self.loop_region,
            loop_bounds: self.loop_bounds(),
            nudge_bars: self.nudge_bars,
            peak_level: self.peak_level,
        }
    }

    /// Render one block of interleaved stereo into `output`.
    ///
    /// Returns `true` if the deck ran off the end of its track during the block.
    pub fn process(&mut self, output: &mut [f32]) -> bool {
        let frames = output.len() / 2;
        let start_gain = self.prev_gain;
        let end_gain = self.gain;
        self.prev_gain = self.gain;

        if self.state != PlaybackState::Playing {
            output.fill(0.0);
            return false;
        }

        let mut ended = false;
        match self.audio.as_mut() {
            None => output.fill(0.0),
            Some(TrackAudio::Stream(stream)) => {
                let read = stream.read(output);
                output[read..].fill(0.0);
                self.position += frames as f64;
            }
            Some(TrackAudio::Buffer(buf)) => {
                let samples = buf.samples();
                let total_frames = buf.frames();

                for frame in output.chunks_exact_mut(2) {
                    if let Some((loop_start, loop_end)) = self.loop_frames {
                        let len = loop_end - loop_start;
                        if len > 0.0 && !(loop_start..loop_end).contains(&self.position) {
                            self.position = loop_start + (self.position - loop_start).rem_euclid(len);
                        }
                    }

                    let idx = self.position as usize;
                    if idx >= total_frames {
                        // End of track
                        frame[0] = 0.0;
                        frame[1] = 0.0;
                        ended = true;
                        continue;
                    }

                    // Linear interpolation for non-integer positions after a nudge
                    let frac = self.position.fract() as f32;
                    let (l0, r0) = (samples[idx * 2], samples[idx * 2 + 1]);
                    if idx + 1 < total_frames && frac > 0.0 {
                        let (l1, r1) = (samples[idx * 2 + 2], samples[idx * 2 + 3]);
                        frame[0] = l0 + frac * (l1 - l0);
                        frame[1] = r0 + frac * (r1 - r0);
                    } else {
                        frame[0] = l0;
                        frame[1] = r0;
                    }
                    self.position += 1.0;
                }
            }
        }

        // Ramp gain across the block so crossfader moves never step
        let mut current_peak = 0.0f32;
        for (i, frame) in output.chunks_exact_mut(2).enumerate() {
            let t = (i + 1) as f32 / frames.max(1) as f32;
            let g = start_gain + (end_gain - start_gain) * t;
            frame[0] *= g;
            frame[1] *= g;
            current_peak = current_peak.max(frame[0].abs()).max(frame[1].abs());
        }
        self.peak_level = self.peak_level * 0.95 + current_peak * 0.05;

        if ended {
            tracing::debug!(deck = %self.id, "end of track");
            self.state = PlaybackState::Stopped;
            self.position = 0.0;
            self.loop_region = None;
            self.loop_frames = None;
        }
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{LiveStream, PcmBuffer};
    use std::sync::Arc;

    const SR: u32 = 1000;

    /// Source that serves a constant-valued buffer, or fails
    struct TestSource {
        seconds: f64,
        fail: bool,
    }

    impl TrackSource for TestSource {
        fn open(&self, _track: &Track) -> Result<TrackAudio, LoadError> {
            if self.fail {
                return Err(LoadError::Unreachable("offline".into()));
            }
            let frames = (self.seconds * SR as f64) as usize;
            let samples: Vec<f32> = (0..frames * 2).map(|i| (i / 2) as f32).collect();
            Ok(TrackAudio::Buffer(PcmBuffer::new(Arc::new(samples), SR)))
        }
    }

    fn loaded_deck(seconds: f64, bpm: f64) -> Deck {
        let mut deck = Deck::new(DeckId::A, SR);
        let track = Track::new("song", ContentType::FullSong).with_bpm(bpm);
        deck.load(track, &TestSource { seconds, fail: false }).unwrap();
        deck
    }

    #[test]
    fn test_load_resolves_duration() {
        let deck = loaded_deck(130.0, 120.0);
        assert_eq!(deck.duration(), Some(130.0));
        assert_eq!(deck.bpm(), Some(120.0));
        assert_eq!(deck.playback(), PlaybackState::Stopped);
    }

    #[test]
    fn test_failed_load_keeps_previous_track() {
        let mut deck = loaded_deck(130.0, 120.0);
        deck.play();
        let err = deck
            .load(
                Track::new("gone", ContentType::Loop),
                &TestSource { seconds: 1.0, fail: true },
            )
            .unwrap_err();
        assert!(matches!(err, MixError::LoadFailure(_)));
        assert_eq!(deck.track().unwrap().source_ref, "song");
        assert_eq!(deck.playback(), PlaybackState::Playing);
    }

    #[test]
    fn test_radio_requires_stream_audio() {
        let mut deck = Deck::new(DeckId::B, SR);
        let err = deck
            .load(
                Track::new("radio", ContentType::RadioStream),
                &TestSource { seconds: 1.0, fail: false },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MixError::LoadFailure(LoadError::ContentMismatch { .. })
        ));
        assert!(!deck.is_loaded());
    }

    #[test]
    fn test_radio_rejects_loop_region() {
        let mut deck = Deck::new(DeckId::B, SR);
        let (_producer, stream) = LiveStream::with_capacity(64, SR);
        deck.attach(
            Track::new("radio", ContentType::RadioStream).with_bpm(120.0),
            TrackAudio::Stream(stream),
        )
        .unwrap();
        assert_eq!(deck.duration(), None);
        assert!(matches!(
            deck.set_loop_region(0, 0),
            Err(MixError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_loop_region_validation() {
        let mut deck = loaded_deck(130.0, 120.0);
        assert!(deck.set_loop_region(0, 8).is_ok());
        assert!(deck.set_loop_region(9, 9).is_err());
        assert!(deck.set_loop_region(-1, 0).is_err());
        assert!(deck.set_loop_region(3, 2).is_err());
    }

    #[test]
    fn test_loop_wraps_within_section() {
        let mut deck = loaded_deck(130.0, 120.0);
        deck.set_loop_region(1, 1).unwrap();
        assert_eq!(deck.loop_bounds(), Some((16.0, 32.0)));
        assert!((deck.position_secs() - 16.0).abs() < 1e-9);

        deck.play();
        // 20 seconds of playback inside a 16 second loop
        let mut out = vec![0.0f32; 20 * SR as usize * 2];
        assert!(!deck.process(&mut out));
        assert!((deck.position_secs() - 20.0).abs() < 1e-6);
        // The frame after the loop end comes from the loop start again
        let wrapped = out[16 * SR as usize * 2];
        assert_eq!(wrapped, 16.0 * SR as f32);
    }

    #[test]
    fn test_seek_outside_loop_wraps_into_region() {
        let mut deck = loaded_deck(130.0, 120.0);
        deck.set_loop_region(1, 1).unwrap();
        deck.play();

        // 100 s is 4 s past the loop start modulo the 16 s loop
        deck.seek(100.0);
        let mut out = vec![0.0f32; 5 * 2];
        deck.process(&mut out);
        let frames: Vec<f32> = out.chunks_exact(2).map(|f| f[0]).collect();
        assert_eq!(frames, vec![20000.0, 20001.0, 20002.0, 20003.0, 20004.0]);

        deck.seek(3.0);
        deck.process(&mut out);
        assert_eq!(out[0], 19000.0);
        assert!(out.chunks_exact(2).all(|f| (16000.0..32000.0).contains(&f[0])));
    }

    #[test]
    fn test_declared_duration_is_checked() {
        let samples = Arc::new(vec![0.0f32; 2000]);
        let mut deck = Deck::new(DeckId::A, SR);
        for bad in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let mut track = Track::new("bad", ContentType::Loop);
            track.duration_secs = Some(bad);
            let err = deck
                .attach(track, TrackAudio::Buffer(PcmBuffer::new(samples.clone(), SR)))
                .unwrap_err();
            assert!(matches!(err, MixError::InvalidParameter(_)));
            assert!(!deck.is_loaded());
        }

        // Longer than the audio: clamped to what was decoded
        let mut track = Track::new("long", ContentType::Loop);
        track.duration_secs = Some(60.0);
        deck.attach(track, TrackAudio::Buffer(PcmBuffer::new(samples, SR)))
            .unwrap();
        assert_eq!(deck.duration(), Some(1.0));
        deck.seek(0.5);
        assert!((deck.position_secs() - 0.5).abs() < 1e-9);
        deck.seek(f64::NAN);
        assert!((deck.position_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_nudge_shifts_loop_bounds() {
        let mut deck = loaded_deck(130.0, 120.0);
        deck.set_loop_region(0, 0).unwrap();
        deck.set_nudge_bars(0.5).unwrap();
        assert_eq!(deck.loop_bounds(), Some((1.0, 17.0)));
    }

    #[test]
    fn test_stop_clears_loop() {
        let mut deck = loaded_deck(130.0, 120.0);
        deck.set_loop_region(2, 3).unwrap();
        deck.play();
        deck.stop();
        assert!(deck.loop_region().is_none());
        assert_eq!(deck.position_secs(), 0.0);
    }

    #[test]
    fn test_end_of_track_stops() {
        let mut deck = loaded_deck(1.0, 120.0);
        deck.play();
        let mut out = vec![0.0f32; 1500 * 2];
        assert!(deck.process(&mut out));
        assert_eq!(deck.playback(), PlaybackState::Stopped);
    }

    #[test]
    fn test_set_bpm_rejects_non_positive() {
        let mut deck = loaded_deck(10.0, 120.0);
        assert!(deck.set_bpm(0.0).is_err());
        assert!(deck.set_bpm(-5.0).is_err());
        assert_eq!(deck.bpm(), Some(120.0));
        deck.set_bpm(128.0).unwrap();
        assert_eq!(deck.bpm(), Some(128.0));
    }

    #[test]
    fn test_gain_ramps_across_block() {
        let mut deck = Deck::new(DeckId::A, SR);
        let samples = Arc::new(vec![1.0f32; 2000]);
        deck.attach(
            Track::new("ones", ContentType::Loop),
            TrackAudio::Buffer(PcmBuffer::new(samples, SR)),
        )
        .unwrap();
        deck.play();
        deck.set_gain(0.0);

        let mut out = vec![0.0f32; 8];
        deck.process(&mut out);
        // ramp from 1.0 down to 0.0 over four frames
        assert!((out[0] - 0.75).abs() < 1e-6);
        assert!(out[6].abs() < 1e-6);
    }
}
