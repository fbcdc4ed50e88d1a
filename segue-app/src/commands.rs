//! Line-based control surface for `segue live`

use segue_audio::{ContentType, CrossfaderCurve, DeckId, EngineCommand};
use std::path::PathBuf;
use thiserror::Error;

pub const HELP: &str = "\
commands:
  load <a|b> <path> [bpm N] [loop|song|radio]
  play <a|b>     pause <a|b>     stop <a|b>     seek <a|b> <secs>
  bpm <a|b> <N>  loop <a|b> <start> <end>       unloop <a|b>
  nudge <a|b> <bars>
  xf <0..1>      curve <linear|equal-power|cut> vol <0..2>
  sync <ref> <follower>          unsync
  rec <bars> [bpm]               stoprec [notail]               cancel
  status         help            quit";

/// Errors parsing a control line
#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("'{0}' is missing an argument")]
    MissingArgument(&'static str),
    #[error("expected deck 'a' or 'b', got '{0}'")]
    BadDeck(String),
    #[error("could not read '{0}' as a number")]
    BadNumber(String),
    #[error("{0}")]
    BadCurve(String),
}

/// A parsed control line
#[derive(Debug)]
pub enum Control {
    /// Forwarded to the engine as-is
    Engine(EngineCommand),
    /// Decoded on the control thread, then forwarded
    Load {
        deck: DeckId,
        path: PathBuf,
        bpm: Option<f64>,
        content: ContentType,
    },
    /// `bpm` is resolved from the decks when omitted
    Record { bars: u32, bpm: Option<f64> },
    Status,
    Help,
    Quit,
}

fn deck(arg: Option<&str>, cmd: &'static str) -> Result<DeckId, CommandError> {
    match arg.ok_or(CommandError::MissingArgument(cmd))? {
        "a" | "A" => Ok(DeckId::A),
        "b" | "B" => Ok(DeckId::B),
        other => Err(CommandError::BadDeck(other.to_string())),
    }
}

fn number<T: std::str::FromStr>(arg: Option<&str>, cmd: &'static str) -> Result<T, CommandError> {
    let arg = arg.ok_or(CommandError::MissingArgument(cmd))?;
    arg.parse()
        .map_err(|_| CommandError::BadNumber(arg.to_string()))
}

/// Parse one line; `Ok(None)` for blank lines
pub fn parse(line: &str) -> Result<Option<Control>, CommandError> {
    let mut args = line.split_whitespace();
    let Some(cmd) = args.next() else {
        return Ok(None);
    };

    let control = match cmd.to_ascii_lowercase().as_str() {
        "play" => Control::Engine(EngineCommand::Play(deck(args.next(), "play")?)),
        "pause" => Control::Engine(EngineCommand::Pause(deck(args.next(), "pause")?)),
        "stop" => Control::Engine(EngineCommand::Stop(deck(args.next(), "stop")?)),
        "seek" => {
            let d = deck(args.next(), "seek")?;
            Control::Engine(EngineCommand::Seek(d, number(args.next(), "seek")?))
        }
        "bpm" => {
            let d = deck(args.next(), "bpm")?;
            Control::Engine(EngineCommand::SetBpm(d, number(args.next(), "bpm")?))
        }
        "loop" => {
            let d = deck(args.next(), "loop")?;
            let start_section = number(args.next(), "loop")?;
            let end_section = number(args.next(), "loop")?;
            Control::Engine(EngineCommand::SetLoopRegion {
                deck: d,
                start_section,
                end_section,
            })
        }
        "unloop" => Control::Engine(EngineCommand::ClearLoopRegion(deck(args.next(), "unloop")?)),
        "nudge" => {
            let d = deck(args.next(), "nudge")?;
            Control::Engine(EngineCommand::SetNudgeBars(d, number(args.next(), "nudge")?))
        }
        "xf" => Control::Engine(EngineCommand::SetCrossfader(number(args.next(), "xf")?)),
        "curve" => {
            let name = args.next().ok_or(CommandError::MissingArgument("curve"))?;
            let curve: CrossfaderCurve = name
                .parse()
                .map_err(|e: segue_audio::MixError| CommandError::BadCurve(e.to_string()))?;
            Control::Engine(EngineCommand::SetCrossfaderCurve(curve))
        }
        "vol" => Control::Engine(EngineCommand::SetMasterVolume(number(args.next(), "vol")?)),
        "sync" => {
            let reference = deck(args.next(), "sync")?;
            let follower = match args.next() {
                Some(arg) => deck(Some(arg), "sync")?,
                None => reference.other(),
            };
            Control::Engine(EngineCommand::EnableSync { reference, follower })
        }
        "unsync" => Control::Engine(EngineCommand::DisableSync),
        "rec" => {
            let bars = number(args.next(), "rec")?;
            let bpm = args.next().map(|b| number(Some(b), "rec")).transpose()?;
            Control::Record { bars, bpm }
        }
        "stoprec" => Control::Engine(EngineCommand::StopRecording {
            capture_tail: args.next() != Some("notail"),
            bpm: None,
        }),
        "cancel" => Control::Engine(EngineCommand::CancelRecording),
        "load" => {
            let d = deck(args.next(), "load")?;
            let path = PathBuf::from(args.next().ok_or(CommandError::MissingArgument("load"))?);
            let mut bpm = None;
            let mut content = ContentType::FullSong;
            while let Some(arg) = args.next() {
                match arg {
                    "bpm" => bpm = Some(number(args.next(), "load")?),
                    "loop" => content = ContentType::Loop,
                    "song" => content = ContentType::FullSong,
                    "radio" => content = ContentType::RadioStream,
                    other => return Err(CommandError::Unknown(other.to_string())),
                }
            }
            Control::Load {
                deck: d,
                path,
                bpm,
                content,
            }
        }
        "status" => Control::Status,
        "help" | "?" => Control::Help,
        "quit" | "exit" | "q" => Control::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(control))
}
