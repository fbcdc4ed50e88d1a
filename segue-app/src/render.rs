//! Offline render - drive the engine without a device and write the recording

use anyhow::{bail, Context, Result};
use segue_audio::{
    ContentType, CrossfaderCurve, DeckId, EngineConfig, MixEngine, RecordingOutcome,
    RecordingResult, SyncStatus, Track,
};
use segue_library::FileTrackSource;
use std::path::PathBuf;

/// What to render
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub deck_a: PathBuf,
    pub bpm_a: f64,
    pub deck_b: Option<(PathBuf, f64)>,
    pub bars: u32,
    pub crossfader: f32,
    pub curve: Option<CrossfaderCurve>,
    pub sync: bool,
    pub loop_section: Option<i64>,
    /// Seconds to skip into deck B before the recording starts
    pub offset_b: f64,
    pub out: PathBuf,
}

/// Run `job` to completion and write the result as WAV
pub fn run(job: &RenderJob, config: EngineConfig, source: &FileTrackSource) -> Result<RecordingResult> {
    let block = config.block_frames;
    let mut engine = MixEngine::new(config).context("invalid engine config")?;

    let track_a = Track::new(job.deck_a.display().to_string(), ContentType::FullSong).with_bpm(job.bpm_a);
    engine
        .load(DeckId::A, track_a, source)
        .with_context(|| format!("loading deck A from {}", job.deck_a.display()))?;
    if let Some((path, bpm)) = &job.deck_b {
        let track_b = Track::new(path.display().to_string(), ContentType::FullSong).with_bpm(*bpm);
        engine
            .load(DeckId::B, track_b, source)
            .with_context(|| format!("loading deck B from {}", path.display()))?;
        engine.seek(DeckId::B, job.offset_b)?;
    }

    if let Some(curve) = job.curve {
        engine.set_crossfader_curve(curve);
    }
    engine.set_crossfader_position(job.crossfader)?;

    let decks: &[DeckId] = if job.deck_b.is_some() {
        &[DeckId::A, DeckId::B]
    } else {
        &[DeckId::A]
    };
    if let Some(section) = job.loop_section {
        for &deck in decks {
            engine.set_loop_region(deck, section, section)?;
        }
    }
    for &deck in decks {
        engine.play(deck);
    }

    if job.sync && job.deck_b.is_some() {
        if let SyncStatus::Unavailable { missing_bpm } = engine.enable_sync(DeckId::A, DeckId::B)? {
            tracing::warn!(deck = %missing_bpm, "sync unavailable");
        }
    }

    let mut pending = engine.start_recording(job.bars, job.bpm_a)?;
    let max_secs = engine.config().max_capture_seconds;
    let max_blocks = (max_secs * engine.sample_rate() as f64 / block as f64).ceil() as usize + 1;
    let mut buffer = vec![0.0f32; block * 2];

    for _ in 0..max_blocks {
        engine.process(&mut buffer);
        if pending.poll().is_some() {
            break;
        }
    }
    for event in engine.drain_events() {
        tracing::debug!(?event, "engine event");
    }

    let result = match pending.wait_timeout(std::time::Duration::ZERO) {
        Ok(RecordingOutcome::Complete(result)) => result,
        Ok(RecordingOutcome::Failed(err)) => return Err(err).context("recording failed"),
        Ok(RecordingOutcome::Cancelled) => bail!("recording was cancelled"),
        Err(_) => bail!("recording did not finish within {max_secs}s"),
    };

    if let Some(parent) = job.out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    result
        .asset
        .write_wav(&job.out)
        .with_context(|| format!("writing {}", job.out.display()))?;
    tracing::info!(
        out = %job.out.display(),
        measured = result.measured_duration,
        target = result.target_duration,
        "render written"
    );
    Ok(result)
}
