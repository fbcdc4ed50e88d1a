//! Section math - 8-bar loop granularity and bar/time conversion
//!
//! All functions here are pure. Tempo values that are not strictly positive
//! fall back to [`FALLBACK_BPM`] with a warning instead of failing, so a deck
//! with a bad tempo tag still gets a usable grid.

/// Beats in one bar (4/4 only)
pub const BEATS_PER_BAR: u32 = 4;

/// Bars in one section
pub const BARS_PER_SECTION: u32 = 8;

/// Beats in one section (8 bars of 4/4)
pub const BEATS_PER_SECTION: u32 = BEATS_PER_BAR * BARS_PER_SECTION;

/// Tempo used when a non-positive BPM reaches the section math
pub const FALLBACK_BPM: f64 = 120.0;

/// Time window covered by one section
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectionRange {
    pub index: u32,
    /// Start time in seconds (shifted by nudge)
    pub start: f64,
    /// End time in seconds (exclusive)
    pub end: f64,
    /// Span in seconds, constant for a given tempo
    pub duration: f64,
}

fn effective_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() && bpm > 0.0 {
        bpm
    } else {
        tracing::warn!(bpm, fallback = FALLBACK_BPM, "invalid BPM in section math, using fallback");
        FALLBACK_BPM
    }
}

/// Duration of one beat in seconds
pub fn seconds_per_beat(bpm: f64) -> f64 {
    60.0 / effective_bpm(bpm)
}

/// Duration of one bar in seconds
pub fn seconds_per_bar(bpm: f64) -> f64 {
    seconds_per_beat(bpm) * BEATS_PER_BAR as f64
}

/// Convert a bar count to seconds (`bars * 4 / bpm * 60`)
pub fn bars_to_seconds(bars: f64, bpm: f64) -> f64 {
    bars * seconds_per_bar(bpm)
}

/// Duration of one 8-bar section in seconds
pub fn section_duration(bpm: f64) -> f64 {
    BEATS_PER_SECTION as f64 * seconds_per_beat(bpm)
}

/// Time range of section `index`, translated by `nudge_bars` bars.
///
/// Nudge moves both bounds by the same amount; the span never changes.
pub fn section_time_range(index: u32, bpm: f64, nudge_bars: f64) -> SectionRange {
    let duration = section_duration(bpm);
    let start = index as f64 * duration + nudge_bars * seconds_per_bar(bpm);
    SectionRange {
        index,
        start,
        end: start + duration,
        duration,
    }
}

/// Number of sections needed to cover a song, counting a trailing partial one
pub fn total_sections(song_duration: f64, bpm: f64) -> u32 {
    if !song_duration.is_finite() || song_duration <= 0.0 {
        return 0;
    }
    (song_duration / section_duration(bpm)).ceil() as u32
}

/// Section index containing time `t` (un-nudged grid)
pub fn section_from_time(t: f64, bpm: f64) -> u32 {
    if t <= 0.0 {
        return 0;
    }
    (t / section_duration(bpm)).floor() as u32
}

/// Whether `index` addresses an existing section of the song
pub fn is_valid_section(index: i64, song_duration: f64, bpm: f64) -> bool {
    index >= 0 && index < total_sections(song_duration, bpm) as i64
}
