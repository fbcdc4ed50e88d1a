//! Mixer implementation - crossfader and mix bus

use crate::deck::Deck;
use crate::error::{MixError, MixResult};
use serde::{Deserialize, Serialize};

/// Crossfader curve type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrossfaderCurve {
    /// Linear crossfade (dips in loudness at the center)
    Linear,
    /// Constant power (equal loudness)
    #[default]
    EqualPower,
    /// Sharp cut (DJ battle style)
    Cut,
}

impl CrossfaderCurve {
    /// Width of the fade zone at each edge for the cut curve
    const CUT_ZONE: f32 = 0.05;

    /// Gains for deck A and deck B at `position` (0.0 = full A, 1.0 = full B)
    pub fn gains(self, position: f32) -> (f32, f32) {
        let p = position.clamp(0.0, 1.0);
        match self {
            CrossfaderCurve::Linear => (1.0 - p, p),
            CrossfaderCurve::EqualPower => {
                let angle = p * std::f32::consts::FRAC_PI_2;
                (angle.cos(), angle.sin())
            }
            CrossfaderCurve::Cut => {
                // Both decks open except for a narrow zone at either edge
                let a = if p < 1.0 - Self::CUT_ZONE {
                    1.0
                } else {
                    (1.0 - p) / Self::CUT_ZONE
                };
                let b = if p > Self::CUT_ZONE {
                    1.0
                } else {
                    p / Self::CUT_ZONE
                };
                (a, b)
            }
        }
    }
}

impl std::str::FromStr for CrossfaderCurve {
    type Err = MixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(CrossfaderCurve::Linear),
            "equal-power" | "equalpower" | "power" => Ok(CrossfaderCurve::EqualPower),
            "cut" => Ok(CrossfaderCurve::Cut),
            other => Err(MixError::invalid(format!("unknown crossfader curve '{other}'"))),
        }
    }
}

/// Crossfader - the only writer of deck gains once mixing has begun
#[derive(Debug, Clone)]
pub struct Crossfader {
    position: f32,
    curve: CrossfaderCurve,
    /// Gains changed since they were last pushed to the decks
    dirty: bool,
}

impl Crossfader {
    pub fn new(curve: CrossfaderCurve) -> Self {
        Self {
            position: 0.5,
            curve,
            dirty: true,
        }
    }

    /// Set crossfader position (0.0 to 1.0)
    pub fn set_position(&mut self, position: f32) -> MixResult<()> {
        if !(0.0..=1.0).contains(&position) {
            return Err(MixError::invalid(format!(
                "crossfader position must be within [0, 1], got {position}"
            )));
        }
        self.position = position;
        self.dirty = true;
        Ok(())
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    /// Set crossfader curve
    pub fn set_curve(&mut self, curve: CrossfaderCurve) {
        self.curve = curve;
        self.dirty = true;
    }

    pub fn curve(&self) -> CrossfaderCurve {
        self.curve
    }

    /// Current gains for deck A and deck B
    pub fn gains(&self) -> (f32, f32) {
        self.curve.gains(self.position)
    }

    /// Push both gains to the decks in one step
    pub(crate) fn apply(&mut self, deck_a: &mut Deck, deck_b: &mut Deck) {
        if !self.dirty {
            return;
        }
        let (gain_a, gain_b) = self.gains();
        deck_a.set_gain(gain_a);
        deck_b.set_gain(gain_b);
        self.dirty = false;
    }
}

/// Mix bus - sums both decks into the master signal
pub struct MixBus {
    /// Master volume
    master_volume: f32,
    /// Smoothed master volume (interpolates toward master_volume to prevent clicks)
    smoothed_master_volume: f32,
}

impl MixBus {
    /// Smoothing coefficient for master volume (~5ms at 48kHz)
    const MASTER_VOLUME_SMOOTH_COEFF: f32 = 0.995;
}

impl Default for MixBus {
    fn default() -> Self {
        Self {
            master_volume: 1.0,
            smoothed_master_volume: 1.0,
        }
    }
}

impl MixBus {
    /// Create a new mix bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Set master volume (0.0 to 2.0)
    pub fn set_master_volume(&mut self, volume: f32) -> MixResult<()> {
        if !volume.is_finite() {
            return Err(MixError::invalid("master volume must be finite"));
        }
        self.master_volume = volume.clamp(0.0, 2.0);
        Ok(())
    }

    /// Get master volume
    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    /// Sum two gain-adjusted stereo buffers into `output`.
    /// All buffers are interleaved stereo.
    pub fn mix(&mut self, deck_a: &[f32], deck_b: &[f32], output: &mut [f32]) {
        let len = output.len().min(deck_a.len()).min(deck_b.len());

        for i in (0..len).step_by(2) {
            self.smoothed_master_volume = Self::MASTER_VOLUME_SMOOTH_COEFF
                * self.smoothed_master_volume
                + (1.0 - Self::MASTER_VOLUME_SMOOTH_COEFF) * self.master_volume;
            let vol = self.smoothed_master_volume;

            output[i] = (deck_a[i] + deck_b[i]) * vol;
            if i + 1 < len {
                output[i + 1] = (deck_a[i + 1] + deck_b[i + 1]) * vol;
            }
        }
        output[len..].fill(0.0);

        // Soft clipping to prevent harsh distortion
        for sample in output.iter_mut() {
            *sample = soft_clip(*sample);
        }
    }
}

/// Soft clip threshold
const SOFT_CLIP_THRESHOLD: f32 = 0.75;
/// Soft clip ceiling
const SOFT_CLIP_CEILING: f32 = 0.89;

/// Gentle soft clipper for the mix bus.
///
/// Transparent below the threshold; above it the signal approaches the
/// ceiling along an exponential knee.
#[inline(always)]
fn soft_clip(x: f32) -> f32 {
    let abs_x = x.abs();
    if abs_x <= SOFT_CLIP_THRESHOLD {
        return x;
    }

    let sign = x.signum();
    let knee_width = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let ratio = (abs_x - SOFT_CLIP_THRESHOLD) / knee_width;
    let compressed = SOFT_CLIP_THRESHOLD + knee_width * (1.0 - (-ratio * 3.0).exp());
    sign * compressed.min(SOFT_CLIP_CEILING)
}
