//! Live mode - cpal output driven by the engine, controlled from stdin

use crate::commands::{self, Control, HELP};
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use segue_audio::{
    ContentType, DeckId, EngineCommand, EngineConfig, EngineEvent, EngineHandle, EngineSnapshot, MixEngine,
    RecordingResult, Track, TrackSource,
};
use segue_library::{FileTrackSource, LibraryConfig, StreamFeeder};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Tracks to load before the prompt appears
pub struct Preload {
    pub deck: DeckId,
    pub path: PathBuf,
    pub bpm: Option<f64>,
}

/// Run until `quit` or end of input
pub fn run(mut config: EngineConfig, library: &LibraryConfig, preload: Vec<Preload>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no audio output device found"))?;
    let output_config = device
        .default_output_config()
        .context("failed to get audio config")?;

    let device_rate = output_config.sample_rate().0;
    if device_rate != config.sample_rate {
        tracing::info!(configured = config.sample_rate, device = device_rate, "using device sample rate");
        config.sample_rate = device_rate;
    }
    let channels = output_config.channels() as usize;

    let engine = Arc::new(Mutex::new(MixEngine::new(config.clone())?));
    let (cmd_tx, cmd_rx, evt_tx, evt_rx) = EngineHandle::create_channels();
    let handle = EngineHandle::new(cmd_tx.clone(), evt_rx);

    let engine_for_callback = engine.clone();
    // Stereo scratch for devices that are not two-channel
    let mut stereo_buffer = vec![0.0f32; 16384];

    let fault_tx = cmd_tx;
    let stream = device
        .build_output_stream(
            &output_config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Use try_lock to avoid blocking the real-time audio thread
                let Some(mut engine) = engine_for_callback.try_lock() else {
                    data.fill(0.0);
                    return;
                };
                while let Ok(cmd) = cmd_rx.try_recv() {
                    engine.handle_command(cmd);
                }
                if channels == 2 {
                    engine.process(data);
                } else {
                    let frames = data.len() / channels.max(1);
                    if stereo_buffer.len() < frames * 2 {
                        stereo_buffer.resize(frames * 2, 0.0);
                    }
                    let stereo = &mut stereo_buffer[..frames * 2];
                    engine.process(stereo);
                    for (out, src) in data.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
                        if channels == 1 {
                            out[0] = (src[0] + src[1]) * 0.5;
                        } else {
                            out[0] = src[0];
                            out[1] = src[1];
                            out[2..].fill(0.0);
                        }
                    }
                }
                forward_events(engine.drain_events(), &evt_tx);
            },
            move |err| {
                tracing::error!(error = %err, "audio stream error");
                let _ = fault_tx.try_send(EngineCommand::CaptureFault(err.to_string()));
            },
            None,
        )
        .context("failed to create audio stream")?;
    stream.play().context("failed to start audio")?;
    tracing::info!(sample_rate = config.sample_rate, channels, "audio running");

    let source = FileTrackSource::new(config.sample_rate);
    let mut session = LiveSession {
        handle,
        engine,
        source,
        recordings_dir: library.recordings_dir(),
        feeders: [None, None],
    };

    for item in preload {
        session.load(item.deck, &item.path, item.bpm, ContentType::FullSong);
    }

    println!("{HELP}");
    let lines = spawn_stdin_reader();
    session.run(lines);

    // Give the callback a few blocks to act on the shutdown command
    for _ in 0..50 {
        if !session.engine.lock().is_running() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
    Ok(())
}

/// Queue engine events for the control thread; returns how many were dropped
fn forward_events(events: Vec<EngineEvent>, tx: &Sender<EngineEvent>) -> usize {
    let mut dropped = 0;
    for event in events {
        if let Err(e) = tx.try_send(event) {
            dropped += 1;
            match e.into_inner() {
                EngineEvent::RecordingComplete(result) => tracing::warn!(
                    session = result.session,
                    "event queue full, finished recording dropped"
                ),
                other => tracing::warn!(event = ?other, "event queue full, event dropped"),
            }
        }
    }
    dropped
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("segue-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "could not read stdin");
    }
    rx
}

struct LiveSession {
    handle: EngineHandle,
    engine: Arc<Mutex<MixEngine>>,
    source: FileTrackSource,
    recordings_dir: PathBuf,
    /// Feeders for radio decks; dropping one stops it
    feeders: [Option<StreamFeeder>; 2],
}

impl LiveSession {
    fn run(&mut self, lines: Receiver<String>) {
        let events = self.handle.event_rx.clone();
        loop {
            select! {
                recv(lines) -> line => {
                    let Ok(line) = line else { break };
                    match commands::parse(&line) {
                        Ok(Some(Control::Quit)) => break,
                        Ok(Some(control)) => self.control(control),
                        Ok(None) => {}
                        Err(e) => println!("{e}"),
                    }
                }
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.on_event(event);
                    }
                }
            }
        }
        if !self.handle.shutdown() {
            tracing::warn!("could not queue engine shutdown");
        }
    }

    fn send(&self, cmd: EngineCommand) {
        if !self.handle.send(cmd) {
            println!("engine busy, command dropped");
        }
    }

    fn control(&mut self, control: Control) {
        match control {
            Control::Engine(cmd) => self.send(cmd),
            Control::Load {
                deck,
                path,
                bpm,
                content,
            } => self.load(deck, &path, bpm, content),
            Control::Record { bars, bpm } => {
                let bpm = bpm.or_else(|| record_bpm(&self.engine.lock().snapshot()));
                match bpm {
                    Some(bpm) => self.send(EngineCommand::StartRecording { bars, bpm }),
                    None => println!("no BPM known; use 'rec <bars> <bpm>'"),
                }
            }
            Control::Status => print_status(&self.engine.lock().snapshot()),
            Control::Help => println!("{HELP}"),
            Control::Quit => {}
        }
    }

    fn load(&mut self, deck: DeckId, path: &Path, bpm: Option<f64>, content: ContentType) {
        let mut track = Track::new(path.display().to_string(), content);
        track.bpm = bpm;

        let opened = if content.capabilities().is_live {
            StreamFeeder::open(path, self.source.loader()).map(|(feeder, audio)| (Some(feeder), audio))
        } else {
            self.source.open(&track).map(|audio| (None, audio))
        };
        match opened {
            Ok((feeder, audio)) => {
                let slot = match deck {
                    DeckId::A => 0,
                    DeckId::B => 1,
                };
                // Replacing the slot stops any previous feeder
                self.feeders[slot] = feeder;
                self.send(EngineCommand::Load { deck, track, audio });
            }
            Err(e) => println!("deck {deck}: load failed: {e}"),
        }
    }

    fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TrackLoaded { deck, source_ref } => println!("deck {deck}: loaded {source_ref}"),
            EngineEvent::DeckEnded(deck) => println!("deck {deck}: end of track"),
            EngineEvent::SyncEnabled(state) => {
                println!("sync: {} follows {}", state.follower, state.reference)
            }
            EngineEvent::SyncUnavailable { missing_bpm } => {
                println!("sync unavailable: deck {missing_bpm} has no BPM")
            }
            EngineEvent::SyncDisabled(reason) => println!("sync off ({reason:?})"),
            EngineEvent::RecordingStarted { bars, bpm, target, .. } => {
                println!("recording {bars} bars at {bpm} BPM ({target:.2}s)")
            }
            EngineEvent::RecordingStopping { stop_at } => println!("capturing tail until {stop_at:.2}s"),
            EngineEvent::RecordingComplete(result) => self.save_recording(&result),
            EngineEvent::RecordingCancelled => println!("recording cancelled"),
            EngineEvent::RecordingFailed(reason) => println!("recording failed: {reason}"),
            EngineEvent::Error(msg) => println!("error: {msg}"),
        }
    }

    fn save_recording(&self, result: &RecordingResult) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let path = self.recordings_dir.join(format!(
            "segue-{stamp}-{}bars-{:.0}bpm.wav",
            result.bars_requested, result.bpm
        ));
        let written = std::fs::create_dir_all(&self.recordings_dir)
            .map_err(hound::Error::from)
            .and_then(|_| result.asset.write_wav(&path));
        match written {
            Ok(()) => println!(
                "saved {} ({:.2}s, drift {:+.3}s)",
                path.display(),
                result.measured_duration,
                result.drift()
            ),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "could not save recording");
                println!("could not save recording: {e}");
            }
        }
    }
}

/// Tempo for a recording: the sync reference, else the first deck with a BPM
fn record_bpm(snapshot: &EngineSnapshot) -> Option<f64> {
    let reference = snapshot.sync.map(|s| s.reference);
    let decks = [&snapshot.deck_a, &snapshot.deck_b];
    reference
        .and_then(|id| decks.iter().find(|d| d.id == id).and_then(|d| d.bpm))
        .or_else(|| decks.iter().find_map(|d| d.bpm))
}

fn print_status(snapshot: &EngineSnapshot) {
    for deck in [&snapshot.deck_a, &snapshot.deck_b] {
        let bpm = deck.bpm.map_or("-".to_string(), |b| format!("{b:.1}"));
        let source = deck.source_ref.as_deref().unwrap_or("(empty)");
        let looping = deck
            .loop_bounds
            .map_or(String::new(), |(s, e)| format!(" loop {s:.2}-{e:.2}s"));
        println!(
            "deck {}: {:?} {:.2}s bpm {bpm} gain {:.2} {source}{looping}",
            deck.id, deck.playback, deck.position, deck.gain
        );
    }
    println!(
        "xf {:.2} ({:?}) vol {:.2} sync {} rec {:?} ({:.2}s) clock {:.2}s",
        snapshot.crossfader,
        snapshot.curve,
        snapshot.master_volume,
        snapshot
            .sync
            .map_or("off".to_string(), |s| format!("{}->{}", s.reference, s.follower)),
        snapshot.recorder.status,
        snapshot.recorder.captured,
        snapshot.clock
    );
}
