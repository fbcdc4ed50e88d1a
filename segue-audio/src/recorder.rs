//! Mixer recorder - captures the mix bus into a bar-exact clip
//!
//! A session records for `bars` bars at a given tempo and stops itself when
//! the target length is reached. An explicit stop can defer the real stop by
//! a two-bar tail so delays and reverbs ring out. Both stop paths are
//! scheduler tasks, so `cancel` only has to drop two handles.
//!
//! Results are delivered through [`PendingRecording`]. A cancelled session
//! never delivers anything; its channel just closes.

use crate::error::{MixError, MixResult};
use crate::scheduler::{ScheduledTask, Scheduler, TaskHandle};
use crate::section;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Frames per capture chunk
const CHUNK_FRAMES: usize = 8192;

/// Recorder channel count (interleaved stereo)
const CHANNELS: u16 = 2;

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
    Stopping,
    Complete,
    Cancelled,
    Error,
}

impl RecordingStatus {
    /// Recording or waiting for the tail to finish
    pub fn is_active(self) -> bool {
        matches!(self, RecordingStatus::Recording | RecordingStatus::Stopping)
    }
}

/// How a stop request was carried out
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopOutcome {
    /// No session to stop
    NotRecording,
    /// Already stopping; request ignored
    AlreadyStopping,
    /// Real stop deferred until `stop_at` seconds on the engine clock
    TailScheduled { stop_at: f64 },
    /// Session finished immediately
    Stopped,
}

/// Captured audio handed to the persistence collaborator
#[derive(Debug, Clone)]
pub struct FinishedAsset {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl FinishedAsset {
    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        }
    }

    /// Encode as a 32-bit float WAV file in memory
    pub fn encode_wav(&self) -> Result<Vec<u8>, hound::Error> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, self.wav_spec())?;
            for &sample in self.samples.iter() {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    /// Write a 32-bit float WAV file
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let bytes = self.encode_wav()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct RecordingResult {
    pub session: u64,
    pub asset: FinishedAsset,
    /// Actual captured length in seconds
    pub measured_duration: f64,
    pub bars_requested: u32,
    pub bpm: f64,
    /// `bars * 4 / bpm * 60`
    pub target_duration: f64,
    /// Tail window that was captured, zero for an immediate stop
    pub tail_duration: f64,
}

impl RecordingResult {
    /// Measured minus expected length (target plus tail)
    pub fn drift(&self) -> f64 {
        self.measured_duration - (self.target_duration + self.tail_duration)
    }
}

/// Final state of a session as seen by the caller
#[derive(Debug)]
pub enum RecordingOutcome {
    Complete(RecordingResult),
    Failed(MixError),
    Cancelled,
}

/// Caller's handle to a session's eventual result
#[derive(Debug)]
pub struct PendingRecording {
    session: u64,
    rx: Receiver<MixResult<RecordingResult>>,
    outcome: Option<RecordingOutcome>,
}

impl PendingRecording {
    pub fn session(&self) -> u64 {
        self.session
    }

    fn resolve(msg: MixResult<RecordingResult>) -> RecordingOutcome {
        match msg {
            Ok(result) => RecordingOutcome::Complete(result),
            Err(err) => RecordingOutcome::Failed(err),
        }
    }

    /// Check for the outcome without blocking
    pub fn poll(&mut self) -> Option<&RecordingOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(msg) => Some(Self::resolve(msg)),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(RecordingOutcome::Cancelled),
            };
        }
        self.outcome.as_ref()
    }

    /// Block until the session ends; gives the handle back on timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<RecordingOutcome, Self> {
        if let Some(outcome) = self.outcome.take() {
            return Ok(outcome);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Self::resolve(msg)),
            Err(RecvTimeoutError::Disconnected) => Ok(RecordingOutcome::Cancelled),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

/// Recorder state for UI rendering
#[derive(Debug, Clone, Serialize)]
pub struct RecorderSnapshot {
    pub status: RecordingStatus,
    pub last_terminal: Option<RecordingStatus>,
    pub session: Option<u64>,
    pub bars: Option<u32>,
    pub bpm: Option<f64>,
    /// Seconds captured so far
    pub captured: f64,
    /// Engine time since the session started
    pub elapsed: Option<f64>,
    pub target: Option<f64>,
}

struct RecordingSession {
    id: u64,
    status: RecordingStatus,
    bars: u32,
    bpm: f64,
    /// Engine clock (seconds) when capture began
    started_at: f64,
    target_secs: f64,
    tail_secs: f64,
    chunks: Vec<Vec<f32>>,
    captured_frames: u64,
    auto_stop: Option<TaskHandle>,
    tail_stop: Option<TaskHandle>,
    result_tx: Sender<MixResult<RecordingResult>>,
}

impl RecordingSession {
    fn push(&mut self, block: &[f32]) {
        let mut rest = block;
        while !rest.is_empty() {
            let needs_chunk = self
                .chunks
                .last()
                .map_or(true, |c| c.len() == c.capacity());
            if needs_chunk {
                self.chunks.push(Vec::with_capacity(CHUNK_FRAMES * CHANNELS as usize));
            }
            let Some(chunk) = self.chunks.last_mut() else {
                return;
            };
            let room = chunk.capacity() - chunk.len();
            let take = room.min(rest.len());
            chunk.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        self.captured_frames += (block.len() / CHANNELS as usize) as u64;
    }

    fn cancel_tasks(&mut self, scheduler: &mut Scheduler) {
        if let Some(h) = self.auto_stop.take() {
            scheduler.cancel(h);
        }
        if let Some(h) = self.tail_stop.take() {
            scheduler.cancel(h);
        }
    }
}

/// Mixer recorder - at most one active session
pub struct Recorder {
    sample_rate: u32,
    session: Option<RecordingSession>,
    next_session: u64,
    /// Tail length in bars
    tail_bars: f64,
    /// Whether the automatic stop also waits for the tail
    tail_on_auto_stop: bool,
    max_capture_frames: u64,
    last_terminal: Option<RecordingStatus>,
}

impl Recorder {
    pub fn new(sample_rate: u32, tail_bars: f64, tail_on_auto_stop: bool, max_capture_secs: f64) -> Self {
        Self {
            sample_rate,
            session: None,
            next_session: 1,
            tail_bars: tail_bars.max(0.0),
            tail_on_auto_stop,
            max_capture_frames: (max_capture_secs.max(0.0) * sample_rate as f64) as u64,
            last_terminal: None,
        }
    }

    /// Current status; `Idle` once a session has ended
    pub fn status(&self) -> RecordingStatus {
        self.session
            .as_ref()
            .map_or(RecordingStatus::Idle, |s| s.status)
    }

    /// How the most recent session ended
    pub fn last_terminal(&self) -> Option<RecordingStatus> {
        self.last_terminal
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Tempo the active session was started with
    pub fn session_bpm(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.bpm)
    }

    /// Frames captured by the active session
    pub fn captured_frames(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.captured_frames)
    }

    /// Engine time at which a deferred stop will fire
    pub fn pending_stop_at(&self, scheduler: &Scheduler) -> Option<f64> {
        let handle = self.session.as_ref()?.tail_stop?;
        scheduler
            .due_frame(handle)
            .map(|f| f as f64 / self.sample_rate as f64)
    }

    /// Engine time at which the automatic stop will fire
    pub fn auto_stop_at(&self, scheduler: &Scheduler) -> Option<f64> {
        let handle = self.session.as_ref()?.auto_stop?;
        scheduler
            .due_frame(handle)
            .map(|f| f as f64 / self.sample_rate as f64)
    }

    /// Begin capturing `bars` bars at `bpm`
    pub fn start(&mut self, bars: u32, bpm: f64, scheduler: &mut Scheduler) -> MixResult<PendingRecording> {
        if self.is_active() {
            tracing::warn!("recording start rejected: session already active");
            return Err(MixError::ConcurrentSessionConflict);
        }
        if bars == 0 {
            return Err(MixError::invalid("bars must be positive"));
        }
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(MixError::invalid(format!("BPM must be positive, got {bpm}")));
        }

        let target_secs = section::bars_to_seconds(bars as f64, bpm);
        let target_frames = scheduler.secs_to_frames(target_secs);
        if !target_secs.is_finite() || target_frames > self.max_capture_frames {
            return Err(MixError::invalid(format!(
                "{bars} bars at {bpm} BPM ({target_secs}s) exceeds the capture limit of {}s",
                self.max_capture_frames as f64 / self.sample_rate as f64
            )));
        }
        let id = self.next_session;
        self.next_session += 1;

        let (result_tx, rx) = bounded(1);
        let auto_stop = scheduler.schedule_after(target_secs, ScheduledTask::RecorderAutoStop { session: id });
        let mut chunks = Vec::with_capacity(target_frames as usize / CHUNK_FRAMES + 1);
        chunks.push(Vec::with_capacity(CHUNK_FRAMES * CHANNELS as usize));

        self.session = Some(RecordingSession {
            id,
            status: RecordingStatus::Recording,
            bars,
            bpm,
            started_at: scheduler.now_secs(),
            target_secs,
            tail_secs: 0.0,
            chunks,
            captured_frames: 0,
            auto_stop: Some(auto_stop),
            tail_stop: None,
            result_tx,
        });
        tracing::info!(session = id, bars, bpm, target_secs, "recording started");

        Ok(PendingRecording {
            session: id,
            rx,
            outcome: None,
        })
    }

    /// Request a stop; with `capture_tail` the real stop is deferred by the
    /// tail window measured from now.
    pub fn stop(&mut self, capture_tail: bool, bpm: f64, scheduler: &mut Scheduler) -> MixResult<(StopOutcome, Option<RecordingResult>)> {
        let Some(session) = self.session.as_ref() else {
            return Ok((StopOutcome::NotRecording, None));
        };
        if session.status == RecordingStatus::Stopping {
            tracing::debug!(session = session.id, "stop ignored: already stopping");
            return Ok((StopOutcome::AlreadyStopping, None));
        }
        if capture_tail && !(bpm.is_finite() && bpm > 0.0) {
            return Err(MixError::invalid(format!("BPM must be positive, got {bpm}")));
        }

        if capture_tail && self.tail_bars > 0.0 {
            let stop_at = self.begin_tail(bpm, scheduler);
            Ok((StopOutcome::TailScheduled { stop_at }, None))
        } else {
            let result = self.finish(scheduler);
            Ok((StopOutcome::Stopped, result))
        }
    }

    /// Discard the active session. Idle recorders are left alone.
    pub fn cancel(&mut self, scheduler: &mut Scheduler) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.cancel_tasks(scheduler);
        tracing::info!(session = session.id, captured = session.captured_frames, "recording cancelled");
        self.last_terminal = Some(RecordingStatus::Cancelled);
        // dropping the session drops its chunks and closes the result channel
        true
    }

    /// Append one mix bus block to the active session
    pub fn capture(&mut self, block: &[f32], scheduler: &mut Scheduler) -> Option<MixError> {
        let session = self.session.as_mut()?;

        if block.len() % CHANNELS as usize != 0 {
            return Some(self.fail("mix bus tap delivered a partial frame".into(), scheduler));
        }
        if block.iter().any(|s| !s.is_finite()) {
            return Some(self.fail("mix bus tap delivered non-finite samples".into(), scheduler));
        }
        let frames = (block.len() / CHANNELS as usize) as u64;
        if session.captured_frames + frames > self.max_capture_frames {
            let limit = self.max_capture_frames as f64 / self.sample_rate as f64;
            return Some(self.fail(format!("capture buffer full ({limit:.1}s)"), scheduler));
        }
        session.push(block);
        None
    }

    /// Abort the active session with a capture failure
    pub fn fail(&mut self, reason: String, scheduler: &mut Scheduler) -> MixError {
        if let Some(mut session) = self.session.take() {
            session.cancel_tasks(scheduler);
            tracing::error!(session = session.id, %reason, "recording failed");
            let _ = session
                .result_tx
                .try_send(Err(MixError::CaptureEngineFailure(reason.clone())));
            self.last_terminal = Some(RecordingStatus::Error);
        }
        MixError::CaptureEngineFailure(reason)
    }

    /// Run a due scheduler task. Tasks from older sessions are ignored.
    pub fn on_task(&mut self, handle: TaskHandle, task: ScheduledTask, scheduler: &mut Scheduler) -> Option<RecordingResult> {
        let session = self.session.as_mut()?;
        match task {
            ScheduledTask::RecorderAutoStop { session: id } if id == session.id && session.auto_stop == Some(handle) => {
                session.auto_stop = None;
                if self.tail_on_auto_stop && self.tail_bars > 0.0 {
                    let bpm = session.bpm;
                    self.begin_tail(bpm, scheduler);
                    None
                } else {
                    self.finish(scheduler)
                }
            }
            ScheduledTask::RecorderTailStop { session: id } if id == session.id && session.tail_stop == Some(handle) => {
                session.tail_stop = None;
                self.finish(scheduler)
            }
            _ => {
                tracing::debug!(?task, "stale recorder task ignored");
                None
            }
        }
    }

    /// Switch to Stopping and schedule the tail stop; returns its due time
    fn begin_tail(&mut self, bpm: f64, scheduler: &mut Scheduler) -> f64 {
        let tail_secs = section::bars_to_seconds(self.tail_bars, bpm);
        let Some(session) = self.session.as_mut() else {
            return scheduler.now_secs();
        };
        if let Some(h) = session.auto_stop.take() {
            scheduler.cancel(h);
        }
        session.status = RecordingStatus::Stopping;
        session.tail_secs = tail_secs;
        let handle = scheduler.schedule_after(tail_secs, ScheduledTask::RecorderTailStop { session: session.id });
        session.tail_stop = Some(handle);

        let stop_at = scheduler
            .due_frame(handle)
            .map_or(scheduler.now_secs(), |f| f as f64 / self.sample_rate as f64);
        tracing::info!(session = session.id, tail_secs, stop_at, "recording stopping with tail");
        stop_at
    }

    /// Close the session and deliver its result
    fn finish(&mut self, scheduler: &mut Scheduler) -> Option<RecordingResult> {
        let mut session = self.session.take()?;
        session.cancel_tasks(scheduler);

        let total = session.chunks.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in session.chunks.drain(..) {
            samples.extend_from_slice(&chunk);
        }

        let asset = FinishedAsset {
            samples: samples.into(),
            sample_rate: self.sample_rate,
            channels: CHANNELS,
        };
        let result = RecordingResult {
            session: session.id,
            measured_duration: asset.duration_secs(),
            asset,
            bars_requested: session.bars,
            bpm: session.bpm,
            target_duration: session.target_secs,
            tail_duration: session.tail_secs,
        };
        tracing::info!(
            session = session.id,
            measured = result.measured_duration,
            target = result.target_duration,
            drift = result.drift(),
            "recording complete"
        );

        // Nobody may be waiting; the event stream still carries the result
        let _ = session.result_tx.try_send(Ok(result.clone()));
        self.last_terminal = Some(RecordingStatus::Complete);
        Some(result)
    }

    pub fn snapshot(&self, scheduler: &Scheduler) -> RecorderSnapshot {
        let session = self.session.as_ref();
        RecorderSnapshot {
            status: self.status(),
            last_terminal: self.last_terminal,
            session: session.map(|s| s.id),
            bars: session.map(|s| s.bars),
            bpm: session.map(|s| s.bpm),
            captured: self.captured_frames() as f64 / self.sample_rate as f64,
            elapsed: session.map(|s| scheduler.now_secs() - s.started_at),
            target: session.map(|s| s.target_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 1000;
    const BLOCK: usize = 100; // frames

    fn recorder() -> (Recorder, Scheduler) {
        (Recorder::new(SR, 2.0, false, 600.0), Scheduler::new(SR))
    }

    /// Capture one block, advance the clock and run due tasks
    fn tick(rec: &mut Recorder, sched: &mut Scheduler, value: f32) -> Option<RecordingResult> {
        let block = vec![value; BLOCK * 2];
        rec.capture(&block, sched);
        sched.advance(BLOCK as u64);
        let mut done = None;
        while let Some((h, task)) = sched.pop_due() {
            if let Some(r) = rec.on_task(h, task, sched) {
                done = Some(r);
            }
        }
        done
    }

    #[test]
    fn test_auto_stop_at_target() {
        let (mut rec, mut sched) = recorder();
        let mut pending = rec.start(8, 120.0, &mut sched).unwrap();
        assert_eq!(rec.auto_stop_at(&sched), Some(16.0));

        let mut result = None;
        for _ in 0..200 {
            if let Some(r) = tick(&mut rec, &mut sched, 0.25) {
                result = Some(r);
                break;
            }
        }
        let result = result.expect("recording should finish");
        assert_eq!(result.bars_requested, 8);
        assert!((result.target_duration - 16.0).abs() < 1e-9);
        assert!((result.measured_duration - 16.0).abs() < 1e-9);
        assert_eq!(result.asset.frames(), 16 * SR as usize);
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(rec.last_terminal(), Some(RecordingStatus::Complete));
        assert!(matches!(pending.poll(), Some(RecordingOutcome::Complete(_))));
        // cached after the channel closes
        assert!(matches!(pending.poll(), Some(RecordingOutcome::Complete(_))));
    }

    #[test]
    fn test_tail_measured_from_stop_call() {
        let (mut rec, mut sched) = recorder();
        // start well after the engine clock began
        sched.advance(5 * SR as u64);
        rec.start(8, 120.0, &mut sched).unwrap();
        for _ in 0..30 {
            tick(&mut rec, &mut sched, 0.1);
        }
        // 3 seconds in
        let stop_call = sched.now_secs();
        let (outcome, result) = rec.stop(true, 120.0, &mut sched).unwrap();
        assert!(result.is_none());
        assert_eq!(outcome, StopOutcome::TailScheduled { stop_at: stop_call + 4.0 });
        assert_eq!(rec.status(), RecordingStatus::Stopping);
        assert_eq!(rec.auto_stop_at(&sched), None);

        let mut done = None;
        for _ in 0..100 {
            if let Some(r) = tick(&mut rec, &mut sched, 0.1) {
                done = Some(r);
                break;
            }
        }
        let done = done.unwrap();
        assert!((sched.now_secs() - (stop_call + 4.0)).abs() < 1e-9);
        assert!((done.measured_duration - 7.0).abs() < 1e-9);
        assert!((done.tail_duration - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_second_stop_is_noop() {
        let (mut rec, mut sched) = recorder();
        rec.start(4, 120.0, &mut sched).unwrap();
        tick(&mut rec, &mut sched, 0.0);
        let (first, _) = rec.stop(true, 120.0, &mut sched).unwrap();
        let stop_at = rec.pending_stop_at(&sched);
        tick(&mut rec, &mut sched, 0.0);
        let (second, result) = rec.stop(false, 120.0, &mut sched).unwrap();
        assert!(matches!(first, StopOutcome::TailScheduled { .. }));
        assert_eq!(second, StopOutcome::AlreadyStopping);
        assert!(result.is_none());
        assert_eq!(rec.pending_stop_at(&sched), stop_at);
    }

    #[test]
    fn test_immediate_stop() {
        let (mut rec, mut sched) = recorder();
        let mut pending = rec.start(8, 120.0, &mut sched).unwrap();
        for _ in 0..10 {
            tick(&mut rec, &mut sched, 0.5);
        }
        let (outcome, result) = rec.stop(false, 120.0, &mut sched).unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        let result = result.unwrap();
        assert!((result.measured_duration - 1.0).abs() < 1e-9);
        assert_eq!(result.tail_duration, 0.0);
        assert_eq!(sched.pending(), 0);
        assert!(matches!(pending.poll(), Some(RecordingOutcome::Complete(_))));
    }

    #[test]
    fn test_concurrent_start_rejected() {
        let (mut rec, mut sched) = recorder();
        let first = rec.start(8, 120.0, &mut sched).unwrap();
        tick(&mut rec, &mut sched, 0.3);
        let captured = rec.captured_frames();
        let auto_stop = rec.auto_stop_at(&sched);

        let err = rec.start(4, 128.0, &mut sched).unwrap_err();
        assert!(matches!(err, MixError::ConcurrentSessionConflict));
        assert_eq!(rec.status(), RecordingStatus::Recording);
        assert_eq!(rec.captured_frames(), captured);
        assert_eq!(rec.auto_stop_at(&sched), auto_stop);
        assert_eq!(rec.snapshot(&sched).session, Some(first.session()));
    }

    #[test]
    fn test_invalid_start_parameters() {
        let (mut rec, mut sched) = recorder();
        assert!(matches!(rec.start(0, 120.0, &mut sched), Err(MixError::InvalidParameter(_))));
        assert!(matches!(rec.start(8, 0.0, &mut sched), Err(MixError::InvalidParameter(_))));
        assert!(matches!(rec.start(8, -1.0, &mut sched), Err(MixError::InvalidParameter(_))));
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_start_beyond_capture_limit_rejected() {
        let (mut rec, mut sched) = recorder();
        for bpm in [1e-300, 0.001] {
            assert!(matches!(rec.start(8, bpm, &mut sched), Err(MixError::InvalidParameter(_))));
        }
        let mut short = Recorder::new(SR, 2.0, false, 10.0);
        assert!(matches!(short.start(8, 120.0, &mut sched), Err(MixError::InvalidParameter(_))));
        assert!(short.start(4, 120.0, &mut sched).is_ok());
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_cancel_idempotent_on_idle() {
        let (mut rec, mut sched) = recorder();
        assert!(!rec.cancel(&mut sched));
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(rec.last_terminal(), None);
    }

    #[test]
    fn test_cancel_discards_and_invalidates_tasks() {
        let (mut rec, mut sched) = recorder();
        let mut pending = rec.start(8, 120.0, &mut sched).unwrap();
        for _ in 0..5 {
            tick(&mut rec, &mut sched, 0.9);
        }
        rec.stop(true, 120.0, &mut sched).unwrap();
        assert!(rec.cancel(&mut sched));
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(rec.last_terminal(), Some(RecordingStatus::Cancelled));
        assert_eq!(sched.pending(), 0);
        assert!(matches!(pending.poll(), Some(RecordingOutcome::Cancelled)));

        // nothing from the cancelled session leaks into the next one
        rec.start(1, 120.0, &mut sched).unwrap();
        let mut result = None;
        while result.is_none() {
            result = tick(&mut rec, &mut sched, -0.2);
        }
        let result = result.unwrap();
        assert_eq!(result.asset.frames(), 2 * SR as usize);
        assert!(result.asset.samples().iter().all(|s| *s == -0.2));
    }

    #[test]
    fn test_capture_failure_rejects_pending() {
        let (mut rec, mut sched) = recorder();
        let mut pending = rec.start(8, 120.0, &mut sched).unwrap();
        tick(&mut rec, &mut sched, 0.1);
        let err = rec.capture(&[f32::NAN, 0.0], &mut sched);
        assert!(matches!(err, Some(MixError::CaptureEngineFailure(_))));
        assert_eq!(rec.status(), RecordingStatus::Idle);
        assert_eq!(rec.last_terminal(), Some(RecordingStatus::Error));
        assert_eq!(sched.pending(), 0);
        assert!(matches!(
            pending.poll(),
            Some(RecordingOutcome::Failed(MixError::CaptureEngineFailure(_)))
        ));
    }

    #[test]
    fn test_capture_limit() {
        // 1 bar at 120 fits, the 4 s tail does not
        let mut rec = Recorder::new(SR, 2.0, false, 2.5);
        let mut sched = Scheduler::new(SR);
        rec.start(1, 120.0, &mut sched).unwrap();
        let (outcome, _) = rec.stop(true, 120.0, &mut sched).unwrap();
        assert!(matches!(outcome, StopOutcome::TailScheduled { .. }));
        for _ in 0..25 {
            assert!(rec.capture(&vec![0.0; BLOCK * 2], &mut sched).is_none());
        }
        assert!(rec.capture(&vec![0.0; BLOCK * 2], &mut sched).is_some());
        assert_eq!(rec.last_terminal(), Some(RecordingStatus::Error));
    }

    #[test]
    fn test_tail_on_auto_stop() {
        let mut rec = Recorder::new(SR, 2.0, true, 600.0);
        let mut sched = Scheduler::new(SR);
        rec.start(1, 120.0, &mut sched).unwrap();
        let mut result = None;
        while result.is_none() {
            result = tick(&mut rec, &mut sched, 0.0);
        }
        let result = result.unwrap();
        assert!((result.measured_duration - 6.0).abs() < 1e-9);
        assert!(result.drift().abs() < 1e-9);
    }

    #[test]
    fn test_stop_on_idle() {
        let (mut rec, mut sched) = recorder();
        let (outcome, result) = rec.stop(true, 120.0, &mut sched).unwrap();
        assert_eq!(outcome, StopOutcome::NotRecording);
        assert!(result.is_none());
    }

    #[test]
    fn test_encode_wav() {
        let asset = FinishedAsset {
            samples: vec![0.0f32, 0.5, -0.5, 0.25].into(),
            sample_rate: 48000,
            channels: 2,
        };
        let bytes = asset.encode_wav().unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn test_write_wav() {
        let asset = FinishedAsset {
            samples: vec![0.1f32; 96].into(),
            sample_rate: 1000,
            channels: 2,
        };
        let path = std::env::temp_dir().join(format!("segue-asset-{}.wav", std::process::id()));
        asset.write_wav(&path).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 1000);
        assert_eq!(reader.duration(), 48);
        std::fs::remove_file(&path).unwrap();
    }
}
