//! Mix engine - owns both decks, the crossfader, sync and the recorder

use crate::deck::{Deck, DeckSnapshot};
use crate::error::{MixError, MixResult};
use crate::mixer::{Crossfader, CrossfaderCurve, MixBus};
use crate::recorder::{PendingRecording, RecorderSnapshot, Recorder, RecordingResult, StopOutcome};
use crate::scheduler::Scheduler;
use crate::sync::{SyncDisableReason, SyncEngine, SyncState, SyncStatus};
use crate::track::{DeckId, Track, TrackAudio, TrackSource};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Engine settings, stored under `[engine]` in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Frames per tick when the engine drives itself (offline render)
    pub block_frames: usize,
    pub sync_tolerance_ms: f64,
    /// Fraction of the phase error removed per tick
    pub sync_correction_rate: f64,
    pub default_curve: CrossfaderCurve,
    pub tail_bars: f64,
    pub tail_on_auto_stop: bool,
    pub max_capture_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_frames: 512,
            sync_tolerance_ms: 5.0,
            sync_correction_rate: 0.5,
            default_curve: CrossfaderCurve::EqualPower,
            tail_bars: 2.0,
            tail_on_auto_stop: false,
            max_capture_seconds: 600.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> MixResult<()> {
        if self.sample_rate == 0 {
            return Err(MixError::invalid("sample_rate must be positive"));
        }
        if self.block_frames == 0 {
            return Err(MixError::invalid("block_frames must be positive"));
        }
        if !(self.sync_tolerance_ms.is_finite() && self.sync_tolerance_ms >= 0.0) {
            return Err(MixError::invalid("sync_tolerance_ms must be >= 0"));
        }
        if !(self.sync_correction_rate > 0.0 && self.sync_correction_rate <= 1.0) {
            return Err(MixError::invalid("sync_correction_rate must be within (0, 1]"));
        }
        if !(self.tail_bars.is_finite() && self.tail_bars >= 0.0) {
            return Err(MixError::invalid("tail_bars must be >= 0"));
        }
        if !(self.max_capture_seconds.is_finite() && self.max_capture_seconds > 0.0) {
            return Err(MixError::invalid("max_capture_seconds must be positive"));
        }
        Ok(())
    }
}

/// Commands sent to the engine from a control thread
#[derive(Debug)]
pub enum EngineCommand {
    /// Swap in a track whose audio was opened off the audio thread
    Load {
        deck: DeckId,
        track: Track,
        audio: TrackAudio,
    },
    Play(DeckId),
    Pause(DeckId),
    Stop(DeckId),
    Seek(DeckId, f64),
    SetBpm(DeckId, f64),
    SetLoopRegion {
        deck: DeckId,
        start_section: i64,
        end_section: i64,
    },
    ClearLoopRegion(DeckId),
    SetNudgeBars(DeckId, f64),

    SetCrossfader(f32),
    SetCrossfaderCurve(CrossfaderCurve),
    SetMasterVolume(f32),

    EnableSync {
        reference: DeckId,
        follower: DeckId,
    },
    DisableSync,

    StartRecording {
        bars: u32,
        bpm: f64,
    },
    /// `bpm` defaults to the session's tempo
    StopRecording {
        capture_tail: bool,
        bpm: Option<f64>,
    },
    CancelRecording,
    /// Capture device reported a fault
    CaptureFault(String),

    Shutdown,
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TrackLoaded { deck: DeckId, source_ref: String },
    DeckEnded(DeckId),
    SyncEnabled(SyncState),
    SyncUnavailable { missing_bpm: DeckId },
    SyncDisabled(SyncDisableReason),
    RecordingStarted { session: u64, bars: u32, bpm: f64, target: f64 },
    RecordingStopping { stop_at: f64 },
    RecordingComplete(RecordingResult),
    RecordingCancelled,
    RecordingFailed(String),
    /// A command was rejected
    Error(String),
}

/// Engine state for UI rendering
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub deck_a: DeckSnapshot,
    pub deck_b: DeckSnapshot,
    pub crossfader: f32,
    pub curve: CrossfaderCurve,
    pub master_volume: f32,
    pub sync: Option<SyncState>,
    pub recorder: RecorderSnapshot,
    /// Engine clock in seconds
    pub clock: f64,
}

/// Mix engine state (held by whoever drives `process`)
pub struct MixEngine {
    config: EngineConfig,
    decks: [Deck; 2],
    crossfader: Crossfader,
    bus: MixBus,
    sync: SyncEngine,
    recorder: Recorder,
    scheduler: Scheduler,
    // Pre-allocated per-deck buffers
    buffer_a: Vec<f32>,
    buffer_b: Vec<f32>,
    events: Vec<EngineEvent>,
    /// Cleared by `shutdown`; a stopped engine renders silence
    running: bool,
}

impl MixEngine {
    pub fn new(config: EngineConfig) -> MixResult<Self> {
        config.validate()?;
        let sr = config.sample_rate;
        let block_samples = config.block_frames * 2;
        Ok(Self {
            decks: [Deck::new(DeckId::A, sr), Deck::new(DeckId::B, sr)],
            crossfader: Crossfader::new(config.default_curve),
            bus: MixBus::new(),
            sync: SyncEngine::new(config.sync_tolerance_ms / 1000.0, config.sync_correction_rate),
            recorder: Recorder::new(sr, config.tail_bars, config.tail_on_auto_stop, config.max_capture_seconds),
            scheduler: Scheduler::new(sr),
            buffer_a: vec![0.0; block_samples],
            buffer_b: vec![0.0; block_samples],
            events: Vec::with_capacity(16),
            running: true,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn deck(&self, id: DeckId) -> &Deck {
        &self.decks[id.index()]
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        self.sync.state()
    }

    /// Engine clock in seconds
    pub fn now_secs(&self) -> f64 {
        self.scheduler.now_secs()
    }

    /// Open `track` through `source` and load it on `deck`
    pub fn load(&mut self, deck: DeckId, track: Track, source: &dyn TrackSource) -> MixResult<()> {
        let audio = source.open(&track)?;
        self.attach(deck, track, audio)
    }

    /// Load audio that was opened elsewhere
    pub fn attach(&mut self, deck: DeckId, track: Track, audio: TrackAudio) -> MixResult<()> {
        let source_ref = track.source_ref.clone();
        self.decks[deck.index()].attach(track, audio)?;
        // A fresh load leaves the deck stopped
        self.deck_stopped(deck);
        self.events.push(EngineEvent::TrackLoaded { deck, source_ref });
        Ok(())
    }

    pub fn play(&mut self, deck: DeckId) {
        self.decks[deck.index()].play();
        tracing::debug!(%deck, state = ?self.decks[deck.index()].playback(), "play");
    }

    pub fn pause(&mut self, deck: DeckId) {
        self.decks[deck.index()].pause();
        tracing::debug!(%deck, "pause");
    }

    /// Stop, rewind and clear the loop. Drops sync if the deck takes part in it.
    pub fn stop(&mut self, deck: DeckId) {
        self.decks[deck.index()].stop();
        tracing::debug!(%deck, "stop");
        self.deck_stopped(deck);
    }

    pub fn seek(&mut self, deck: DeckId, position_secs: f64) -> MixResult<()> {
        if !position_secs.is_finite() {
            return Err(MixError::invalid("seek position must be finite"));
        }
        self.decks[deck.index()].seek(position_secs);
        Ok(())
    }

    pub fn set_bpm(&mut self, deck: DeckId, bpm: f64) -> MixResult<()> {
        self.decks[deck.index()].set_bpm(bpm)
    }

    pub fn set_loop_region(&mut self, deck: DeckId, start_section: i64, end_section: i64) -> MixResult<()> {
        self.decks[deck.index()].set_loop_region(start_section, end_section)
    }

    pub fn clear_loop_region(&mut self, deck: DeckId) {
        self.decks[deck.index()].clear_loop_region();
    }

    pub fn set_nudge_bars(&mut self, deck: DeckId, nudge_bars: f64) -> MixResult<()> {
        self.decks[deck.index()].set_nudge_bars(nudge_bars)
    }

    /// Takes effect at the start of the next tick
    pub fn set_crossfader_position(&mut self, position: f32) -> MixResult<()> {
        self.crossfader.set_position(position)
    }

    pub fn set_crossfader_curve(&mut self, curve: CrossfaderCurve) {
        self.crossfader.set_curve(curve);
    }

    pub fn set_master_volume(&mut self, volume: f32) -> MixResult<()> {
        self.bus.set_master_volume(volume)
    }

    pub fn enable_sync(&mut self, reference: DeckId, follower: DeckId) -> MixResult<SyncStatus> {
        let status = self.sync.enable(reference, follower, &self.decks)?;
        self.events.push(match status {
            SyncStatus::Enabled(state) => EngineEvent::SyncEnabled(state),
            SyncStatus::Unavailable { missing_bpm } => EngineEvent::SyncUnavailable { missing_bpm },
        });
        Ok(status)
    }

    pub fn disable_sync(&mut self) -> Option<SyncState> {
        let previous = self.sync.disable(SyncDisableReason::Requested);
        if previous.is_some() {
            self.events.push(EngineEvent::SyncDisabled(SyncDisableReason::Requested));
        }
        previous
    }

    /// Record `bars` bars of the mix bus at `bpm`
    pub fn start_recording(&mut self, bars: u32, bpm: f64) -> MixResult<PendingRecording> {
        let pending = self.recorder.start(bars, bpm, &mut self.scheduler)?;
        self.events.push(EngineEvent::RecordingStarted {
            session: pending.session(),
            bars,
            bpm,
            target: crate::section::bars_to_seconds(bars as f64, bpm),
        });
        Ok(pending)
    }

    pub fn stop_recording(&mut self, capture_tail: bool, bpm: f64) -> MixResult<StopOutcome> {
        let (outcome, result) = self.recorder.stop(capture_tail, bpm, &mut self.scheduler)?;
        match outcome {
            StopOutcome::TailScheduled { stop_at } => {
                self.events.push(EngineEvent::RecordingStopping { stop_at });
            }
            StopOutcome::Stopped => {
                if let Some(result) = result {
                    self.events.push(EngineEvent::RecordingComplete(result));
                }
            }
            StopOutcome::NotRecording | StopOutcome::AlreadyStopping => {}
        }
        Ok(outcome)
    }

    /// Drop the active recording, if any
    pub fn cancel_recording(&mut self) -> bool {
        let cancelled = self.recorder.cancel(&mut self.scheduler);
        if cancelled {
            self.events.push(EngineEvent::RecordingCancelled);
        }
        cancelled
    }

    /// Fail the active recording because the capture path broke
    pub fn capture_fault(&mut self, reason: impl Into<String>) {
        if !self.recorder.is_active() {
            return;
        }
        let err = self.recorder.fail(reason.into(), &mut self.scheduler);
        self.events.push(EngineEvent::RecordingFailed(err.to_string()));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Cancel any recording, stop both decks and go silent
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.cancel_recording();
        for deck in [DeckId::A, DeckId::B] {
            self.stop(deck);
        }
        self.running = false;
        tracing::info!("engine shut down");
    }

    /// Process a command
    pub fn handle_command(&mut self, cmd: EngineCommand) {
        let result = match cmd {
            EngineCommand::Load { deck, track, audio } => self.attach(deck, track, audio),
            EngineCommand::Play(deck) => {
                self.play(deck);
                Ok(())
            }
            EngineCommand::Pause(deck) => {
                self.pause(deck);
                Ok(())
            }
            EngineCommand::Stop(deck) => {
                self.stop(deck);
                Ok(())
            }
            EngineCommand::Seek(deck, secs) => self.seek(deck, secs),
            EngineCommand::SetBpm(deck, bpm) => self.set_bpm(deck, bpm),
            EngineCommand::SetLoopRegion {
                deck,
                start_section,
                end_section,
            } => self.set_loop_region(deck, start_section, end_section),
            EngineCommand::ClearLoopRegion(deck) => {
                self.clear_loop_region(deck);
                Ok(())
            }
            EngineCommand::SetNudgeBars(deck, bars) => self.set_nudge_bars(deck, bars),
            EngineCommand::SetCrossfader(pos) => self.set_crossfader_position(pos),
            EngineCommand::SetCrossfaderCurve(curve) => {
                self.set_crossfader_curve(curve);
                Ok(())
            }
            EngineCommand::SetMasterVolume(vol) => self.set_master_volume(vol),
            EngineCommand::EnableSync { reference, follower } => {
                self.enable_sync(reference, follower).map(|_| ())
            }
            EngineCommand::DisableSync => {
                self.disable_sync();
                Ok(())
            }
            // The result arrives as an event
            EngineCommand::StartRecording { bars, bpm } => self.start_recording(bars, bpm).map(|_| ()),
            EngineCommand::StopRecording { capture_tail, bpm } => {
                let bpm = bpm.or(self.recorder.session_bpm()).unwrap_or(crate::section::FALLBACK_BPM);
                self.stop_recording(capture_tail, bpm).map(|_| ())
            }
            EngineCommand::CancelRecording => {
                self.cancel_recording();
                Ok(())
            }
            EngineCommand::CaptureFault(reason) => {
                self.capture_fault(reason);
                Ok(())
            }
            EngineCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(%err, "command rejected");
            self.events.push(EngineEvent::Error(err.to_string()));
        }
    }

    /// Take all events queued since the last call
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            deck_a: self.decks[0].snapshot(),
            deck_b: self.decks[1].snapshot(),
            crossfader: self.crossfader.position(),
            curve: self.crossfader.curve(),
            master_volume: self.bus.master_volume(),
            sync: self.sync.state(),
            recorder: self.recorder.snapshot(&self.scheduler),
            clock: self.scheduler.now_secs(),
        }
    }

    /// Render one tick into `output` (interleaved stereo)
    pub fn process(&mut self, output: &mut [f32]) {
        // whole frames only
        let len = output.len() & !1;
        let frames = len / 2;
        output[len..].fill(0.0);
        let output = &mut output[..len];
        if !self.running {
            output.fill(0.0);
            return;
        }

        // This should rarely happen after the first call
        if len > self.buffer_a.len() {
            self.buffer_a.resize(len, 0.0);
            self.buffer_b.resize(len, 0.0);
        }
        let buf_a = &mut self.buffer_a[..len];
        let buf_b = &mut self.buffer_b[..len];

        // 1. Crossfader gains for both decks at once
        let [deck_a, deck_b] = &mut self.decks;
        self.crossfader.apply(deck_a, deck_b);

        // 2. Sync reads both positions, then moves the follower
        self.sync.tick(&mut self.decks);

        // 3. Render decks
        for (deck, buf) in self.decks.iter_mut().zip([&mut *buf_a, &mut *buf_b]) {
            if deck.process(buf) {
                let id = deck.id();
                self.events.push(EngineEvent::DeckEnded(id));
                if self.sync.on_deck_stopped(id).is_some() {
                    self.events.push(EngineEvent::SyncDisabled(SyncDisableReason::DeckStopped(id)));
                }
            }
        }

        // 4. Mix bus, then the recorder tap
        self.bus.mix(buf_a, buf_b, output);
        if let Some(err) = self.recorder.capture(output, &mut self.scheduler) {
            self.events.push(EngineEvent::RecordingFailed(err.to_string()));
        }

        // 5. Clock and due tasks
        self.scheduler.advance(frames as u64);
        while let Some((handle, task)) = self.scheduler.pop_due() {
            if let Some(result) = self.recorder.on_task(handle, task, &mut self.scheduler) {
                self.events.push(EngineEvent::RecordingComplete(result));
            }
        }
    }

    fn deck_stopped(&mut self, deck: DeckId) {
        if self.sync.on_deck_stopped(deck).is_some() {
            self.events.push(EngineEvent::SyncDisabled(SyncDisableReason::DeckStopped(deck)));
        }
    }
}

/// Handle to communicate with an engine running on another thread
pub struct EngineHandle {
    /// Send commands to the audio thread
    pub command_tx: Sender<EngineCommand>,
    /// Receive events from the audio thread
    pub event_rx: Receiver<EngineEvent>,
}

impl EngineHandle {
    /// Create channels for engine communication
    pub fn create_channels() -> (
        Sender<EngineCommand>,
        Receiver<EngineCommand>,
        Sender<EngineEvent>,
        Receiver<EngineEvent>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(1024);
        let (evt_tx, evt_rx) = bounded(1024);
        (cmd_tx, cmd_rx, evt_tx, evt_rx)
    }

    pub fn new(command_tx: Sender<EngineCommand>, event_rx: Receiver<EngineEvent>) -> Self {
        Self { command_tx, event_rx }
    }

    /// Send a command; dropped if the queue is full
    pub fn send(&self, cmd: EngineCommand) -> bool {
        self.command_tx.try_send(cmd).is_ok()
    }

    /// Ask the audio thread to stop the engine
    pub fn shutdown(&self) -> bool {
        self.send(EngineCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::PlaybackState;
    use crate::recorder::{RecordingOutcome, RecordingStatus};
    use crate::track::{ContentType, LoadError, PcmBuffer};

    const SR: u32 = 1000;
    const BLOCK: usize = 100;

    /// Serves a constant-valued stereo buffer
    struct ConstSource {
        seconds: f64,
        value: f32,
    }

    impl TrackSource for ConstSource {
        fn open(&self, track: &Track) -> Result<TrackAudio, LoadError> {
            if track.source_ref.starts_with("missing") {
                return Err(LoadError::Unreachable(track.source_ref.clone()));
            }
            let frames = (self.seconds * SR as f64) as usize;
            let samples = std::sync::Arc::new(vec![self.value; frames * 2]);
            Ok(TrackAudio::Buffer(PcmBuffer::new(samples, SR)))
        }
    }

    fn engine() -> MixEngine {
        let config = EngineConfig {
            sample_rate: SR,
            block_frames: BLOCK,
            ..EngineConfig::default()
        };
        MixEngine::new(config).unwrap()
    }

    fn loaded_engine() -> MixEngine {
        let mut engine = engine();
        let src = ConstSource { seconds: 120.0, value: 0.2 };
        engine
            .load(DeckId::A, Track::new("a.wav", ContentType::FullSong).with_bpm(120.0), &src)
            .unwrap();
        engine
            .load(DeckId::B, Track::new("b.wav", ContentType::Loop).with_bpm(124.0), &src)
            .unwrap();
        engine
    }

    fn run(engine: &mut MixEngine, blocks: usize) {
        let mut out = vec![0.0f32; BLOCK * 2];
        for _ in 0..blocks {
            engine.process(&mut out);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig {
            sync_correction_rate: 0.0,
            ..EngineConfig::default()
        };
        assert!(MixEngine::new(bad).is_err());
    }

    #[test]
    fn test_sixteen_second_recording() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        engine.play(DeckId::B);
        let mut pending = engine.start_recording(8, 120.0).unwrap();

        run(&mut engine, 159);
        assert!(pending.poll().is_none());
        run(&mut engine, 1);

        let Some(RecordingOutcome::Complete(result)) = pending.poll() else {
            panic!("recording should be complete");
        };
        assert!((result.measured_duration - 16.0).abs() < 1e-9);
        assert_eq!(result.bars_requested, 8);
        assert!(result.asset.samples().iter().any(|s| *s != 0.0));
        assert_eq!(engine.recorder().status(), RecordingStatus::Idle);

        let events = engine.drain_events();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::RecordingStarted { bars: 8, .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::RecordingComplete(_))));
    }

    #[test]
    fn test_tail_stop_four_seconds_after_call() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        let pending = engine.start_recording(8, 120.0).unwrap();
        run(&mut engine, 30);

        let call = engine.now_secs();
        let outcome = engine.stop_recording(true, 120.0).unwrap();
        assert_eq!(outcome, StopOutcome::TailScheduled { stop_at: call + 4.0 });

        run(&mut engine, 40);
        match pending.wait_timeout(std::time::Duration::from_millis(1)) {
            Ok(RecordingOutcome::Complete(result)) => {
                assert!((result.measured_duration - 7.0).abs() < 1e-9);
                assert!((result.tail_duration - 4.0).abs() < 1e-9);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_start_rejected() {
        let mut engine = loaded_engine();
        let _first = engine.start_recording(4, 120.0).unwrap();
        assert!(matches!(
            engine.start_recording(4, 120.0),
            Err(MixError::ConcurrentSessionConflict)
        ));
        assert_eq!(engine.recorder().status(), RecordingStatus::Recording);
    }

    #[test]
    fn test_cancel_then_record_again() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        let mut first = engine.start_recording(8, 120.0).unwrap();
        run(&mut engine, 50);
        assert!(engine.cancel_recording());
        assert!(!engine.cancel_recording());
        // the cancelled auto-stop must not end the next session early
        let mut second = engine.start_recording(1, 120.0).unwrap();
        run(&mut engine, 20);

        assert!(matches!(first.poll(), Some(RecordingOutcome::Cancelled)));
        let Some(RecordingOutcome::Complete(result)) = second.poll() else {
            panic!("second session should complete");
        };
        assert_eq!(result.asset.frames(), 2 * SR as usize);
    }

    #[test]
    fn test_capture_fault_fails_session() {
        let mut engine = loaded_engine();
        let mut pending = engine.start_recording(8, 120.0).unwrap();
        run(&mut engine, 3);
        engine.handle_command(EngineCommand::CaptureFault("device lost".into()));
        assert!(matches!(
            pending.poll(),
            Some(RecordingOutcome::Failed(MixError::CaptureEngineFailure(_)))
        ));
        assert_eq!(engine.recorder().last_terminal(), Some(RecordingStatus::Error));
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::RecordingFailed(_))));
    }

    #[test]
    fn test_crossfader_silences_deck_b() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        engine.play(DeckId::B);
        engine.set_crossfader_curve(CrossfaderCurve::Linear);
        engine.set_crossfader_position(0.0).unwrap();
        run(&mut engine, 2);
        assert_eq!(engine.deck(DeckId::A).gain(), 1.0);
        assert_eq!(engine.deck(DeckId::B).gain(), 0.0);
        assert!(engine.set_crossfader_position(1.2).is_err());
    }

    #[test]
    fn test_stop_disables_sync() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        engine.play(DeckId::B);
        assert!(matches!(
            engine.enable_sync(DeckId::A, DeckId::B).unwrap(),
            SyncStatus::Enabled(_)
        ));
        run(&mut engine, 2);
        engine.stop(DeckId::A);
        assert!(engine.sync_state().is_none());
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::SyncDisabled(SyncDisableReason::DeckStopped(DeckId::A)))));
    }

    #[test]
    fn test_end_of_track_disables_sync() {
        let mut engine = engine();
        let short = ConstSource { seconds: 0.5, value: 0.1 };
        engine
            .load(DeckId::A, Track::new("short", ContentType::Loop).with_bpm(120.0), &short)
            .unwrap();
        engine
            .load(DeckId::B, Track::new("long", ContentType::FullSong).with_bpm(120.0), &ConstSource { seconds: 10.0, value: 0.1 })
            .unwrap();
        engine.play(DeckId::A);
        engine.play(DeckId::B);
        engine.enable_sync(DeckId::B, DeckId::A).unwrap();
        run(&mut engine, 6);

        assert_eq!(engine.deck(DeckId::A).playback(), PlaybackState::Stopped);
        assert!(engine.sync_state().is_none());
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::DeckEnded(DeckId::A))));
    }

    #[test]
    fn test_failed_load_reports_and_keeps_deck() {
        let mut engine = loaded_engine();
        let src = ConstSource { seconds: 1.0, value: 0.0 };
        let err = engine
            .load(DeckId::A, Track::new("missing.mp3", ContentType::FullSong), &src)
            .unwrap_err();
        assert!(matches!(err, MixError::LoadFailure(_)));
        assert_eq!(engine.deck(DeckId::A).track().unwrap().source_ref, "a.wav");
    }

    #[test]
    fn test_rejected_command_emits_error() {
        let mut engine = loaded_engine();
        engine.drain_events();
        engine.handle_command(EngineCommand::SetBpm(DeckId::A, -3.0));
        engine.handle_command(EngineCommand::SetLoopRegion {
            deck: DeckId::B,
            start_section: 2,
            end_section: 1,
        });
        let events = engine.drain_events();
        assert_eq!(events.iter().filter(|e| matches!(e, EngineEvent::Error(_))).count(), 2);
        assert_eq!(engine.deck(DeckId::A).bpm(), Some(120.0));
    }

    #[test]
    fn test_stop_recording_command_uses_session_bpm() {
        let mut engine = loaded_engine();
        engine.handle_command(EngineCommand::StartRecording { bars: 8, bpm: 124.0 });
        run(&mut engine, 10);
        engine.drain_events();
        engine.handle_command(EngineCommand::StopRecording {
            capture_tail: true,
            bpm: None,
        });
        let events = engine.drain_events();
        let Some(EngineEvent::RecordingStopping { stop_at }) = events.first() else {
            panic!("expected a stopping event, got {events:?}");
        };
        // two bars at 124 BPM
        let tail = 8.0 * 60.0 / 124.0;
        assert!((stop_at - (1.0 + tail)).abs() <= 1.0 / SR as f64);
    }

    #[test]
    fn test_snapshot() {
        let mut engine = loaded_engine();
        engine.set_loop_region(DeckId::A, 0, 1).unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.deck_a.loop_bounds, Some((0.0, 32.0)));
        assert_eq!(snap.curve, CrossfaderCurve::EqualPower);
        assert_eq!(snap.recorder.status, RecordingStatus::Idle);
    }

    /// Serves a buffer whose samples hold their own frame index
    struct RampSource;

    impl TrackSource for RampSource {
        fn open(&self, _track: &Track) -> Result<TrackAudio, LoadError> {
            let samples: Vec<f32> = (0..10 * SR as usize * 2).map(|i| (i / 2) as f32).collect();
            Ok(TrackAudio::Buffer(PcmBuffer::new(std::sync::Arc::new(samples), SR)))
        }
    }

    #[test]
    fn test_tick_applies_gains_and_sync_before_render() {
        let mut engine = engine();
        let ones = ConstSource { seconds: 10.0, value: 1.0 };
        engine
            .load(DeckId::A, Track::new("a.wav", ContentType::Loop).with_bpm(120.0), &ones)
            .unwrap();
        engine
            .load(DeckId::B, Track::new("b.wav", ContentType::Loop).with_bpm(120.0), &RampSource)
            .unwrap();
        engine.play(DeckId::A);
        engine.play(DeckId::B);
        engine.seek(DeckId::B, 0.1).unwrap();

        // Both changes land before the first tick
        engine.set_crossfader_position(1.0).unwrap();
        assert!(matches!(
            engine.enable_sync(DeckId::A, DeckId::B).unwrap(),
            SyncStatus::Enabled(_)
        ));
        run(&mut engine, 1);

        // Deck A ramps from full gain to silence over this block
        let frames = BLOCK as f32;
        assert!((engine.buffer_a[0] - (1.0 - 1.0 / frames)).abs() < 1e-4);
        assert!(engine.buffer_a[(BLOCK - 1) * 2].abs() < 1e-4);

        // Follower was 0.1 s ahead of the beat with both decks at their
        // pre-render positions; half of that was corrected before it rendered
        assert!((engine.buffer_b[0] - 50.0).abs() < 1e-3);
        assert!((engine.buffer_b[(BLOCK - 1) * 2] - 149.0).abs() < 1e-3);
        assert!((engine.deck(DeckId::B).position_secs() - 0.15).abs() < 1e-6);
        assert!((engine.deck(DeckId::A).position_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_shutdown_cancels_and_silences() {
        let mut engine = loaded_engine();
        engine.play(DeckId::A);
        let pending = engine.start_recording(4, 120.0).unwrap();
        run(&mut engine, 3);

        engine.handle_command(EngineCommand::Shutdown);
        assert!(!engine.is_running());
        assert!(matches!(
            pending.wait_timeout(std::time::Duration::from_millis(1)),
            Ok(RecordingOutcome::Cancelled)
        ));
        assert_eq!(engine.deck(DeckId::A).playback(), PlaybackState::Stopped);

        engine.play(DeckId::A);
        let mut out = vec![1.0f32; BLOCK * 2];
        engine.process(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::RecordingCancelled)));
    }

    #[test]
    fn test_independent_engines() {
        let mut one = loaded_engine();
        let two = loaded_engine();
        one.play(DeckId::A);
        run(&mut one, 10);
        assert!(one.deck(DeckId::A).position_secs() > 0.0);
        assert_eq!(two.deck(DeckId::A).position_secs(), 0.0);
    }
}
