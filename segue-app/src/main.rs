//! Segue - beat-synchronized two-deck mixer and recorder
//!
//! `segue render` mixes offline into a WAV file; `segue live` plays through
//! the default output device with a line-based control prompt.

mod commands;
mod live;
mod render;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use segue_audio::{CrossfaderCurve, DeckId};
use segue_library::{Config, FileTrackSource};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "segue")]
#[command(about = "Beat-synchronized two-deck mixer and recorder")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine sample rate override
    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mix one or two tracks offline and record a fixed number of bars
    Render(RenderArgs),

    /// Play through the audio device with a stdin control prompt
    Live(LiveArgs),

    /// Show the config file location, or write one with defaults
    Config {
        /// Write the current settings to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Track for deck A
    #[arg(long = "a")]
    deck_a: PathBuf,

    /// Tempo of deck A; also the recording tempo
    #[arg(long)]
    bpm_a: f64,

    /// Track for deck B
    #[arg(long = "b", requires = "bpm_b")]
    deck_b: Option<PathBuf>,

    /// Tempo of deck B
    #[arg(long)]
    bpm_b: Option<f64>,

    /// Seconds into deck B where playback starts
    #[arg(long, default_value_t = 0.0)]
    offset_b: f64,

    /// Bars to record
    #[arg(long)]
    bars: u32,

    /// Crossfader position, 0 = deck A, 1 = deck B
    #[arg(long, default_value_t = 0.5)]
    crossfader: f32,

    /// Crossfader curve: linear, equal-power or cut
    #[arg(long)]
    curve: Option<CrossfaderCurve>,

    /// Lock deck B's beat phase to deck A
    #[arg(long)]
    sync: bool,

    /// Loop both decks inside this 8-bar section
    #[arg(long)]
    loop_section: Option<i64>,

    /// Keep recording for the tail after the target length
    #[arg(long)]
    tail: bool,

    /// Output WAV file
    #[arg(short, long)]
    out: PathBuf,
}

#[derive(Args)]
struct LiveArgs {
    /// Track to load on deck A
    #[arg(long = "a")]
    deck_a: Option<PathBuf>,

    #[arg(long)]
    bpm_a: Option<f64>,

    /// Track to load on deck B
    #[arg(long = "b")]
    deck_b: Option<PathBuf>,

    #[arg(long)]
    bpm_b: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(rate) = cli.sample_rate {
        config.engine.sample_rate = rate;
    }

    match cli.command {
        Commands::Render(args) => {
            let mut engine_config = config.engine.clone();
            engine_config.tail_on_auto_stop |= args.tail;
            let source = FileTrackSource::new(engine_config.sample_rate);
            let job = render::RenderJob {
                deck_a: args.deck_a,
                bpm_a: args.bpm_a,
                deck_b: args.deck_b.zip(args.bpm_b),
                bars: args.bars,
                crossfader: args.crossfader,
                curve: args.curve,
                sync: args.sync,
                loop_section: args.loop_section,
                offset_b: args.offset_b,
                out: args.out,
            };
            let result = render::run(&job, engine_config, &source)?;
            println!(
                "{}: {} bars at {} BPM, {:.3}s (target {:.3}s, tail {:.3}s)",
                job.out.display(),
                result.bars_requested,
                result.bpm,
                result.measured_duration,
                result.target_duration,
                result.tail_duration
            );
        }
        Commands::Live(args) => {
            let mut preload = Vec::new();
            for (deck, path, bpm) in [
                (DeckId::A, args.deck_a, args.bpm_a),
                (DeckId::B, args.deck_b, args.bpm_b),
            ] {
                if let Some(path) = path {
                    if let Some(folder) = path.parent() {
                        config.library.last_track_folder = Some(folder.to_path_buf());
                    }
                    preload.push(live::Preload { deck, path, bpm });
                }
            }
            if !preload.is_empty() && cli.config.is_none() {
                if let Err(e) = config.save() {
                    tracing::warn!(error = %e, "could not save config");
                }
            }
            live::run(config.engine.clone(), &config.library, preload)?;
        }
        Commands::Config { init } => {
            let path = cli.config.unwrap_or_else(Config::config_path);
            if init {
                config.save_to(&path)?;
                println!("wrote {}", path.display());
            } else {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
