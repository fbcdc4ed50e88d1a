//! Beat sync - keeps a follower deck's beat phase locked to a reference deck
//!
//! Sync works on position only. Each tick the follower's phase within its beat
//! is compared with the reference's phase (rescaled to the follower's beat
//! length); when the difference exceeds the tolerance the follower is nudged
//! toward zero error. Tempo and pitch are never touched.

use crate::deck::Deck;
use crate::error::{MixError, MixResult};
use crate::track::DeckId;
use serde::Serialize;

/// Active reference/follower relationship
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncState {
    pub reference: DeckId,
    pub follower: DeckId,
    /// Reference deck's position within its beat when sync was enabled
    pub lock_phase_seconds: f64,
}

/// Outcome of an enable request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncStatus {
    Enabled(SyncState),
    /// A deck has no BPM; nothing was changed
    Unavailable { missing_bpm: DeckId },
}

/// Why sync was switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncDisableReason {
    Requested,
    DeckStopped(DeckId),
}

/// Phase error of the follower in seconds, wrapped to half a follower beat.
///
/// Positive means the follower is ahead of the reference.
pub fn phase_error(
    follower_pos: f64,
    follower_bpm: f64,
    reference_pos: f64,
    reference_bpm: f64,
) -> f64 {
    let follower_beat = 60.0 / follower_bpm;
    let reference_beat = 60.0 / reference_bpm;

    let follower_phase = follower_pos.rem_euclid(follower_beat);
    let reference_phase = reference_pos.rem_euclid(reference_beat) * (follower_beat / reference_beat);

    let mut error = follower_phase - reference_phase;
    // Shortest path to alignment
    if error >= follower_beat / 2.0 {
        error -= follower_beat;
    } else if error < -follower_beat / 2.0 {
        error += follower_beat;
    }
    error
}

/// Sync engine - at most one relationship per mixer
#[derive(Debug)]
pub struct SyncEngine {
    state: Option<SyncState>,
    /// Errors at or below this are left alone (seconds)
    tolerance: f64,
    /// Fraction of the error corrected per tick (0, 1]
    correction_rate: f64,
}

impl SyncEngine {
    pub fn new(tolerance_secs: f64, correction_rate: f64) -> Self {
        Self {
            state: None,
            tolerance: tolerance_secs.max(0.0),
            correction_rate: correction_rate.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn state(&self) -> Option<SyncState> {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Lock `follower` to `reference`, replacing any existing relationship.
    ///
    /// Reports [`SyncStatus::Unavailable`] without touching anything when
    /// either deck lacks a BPM.
    pub fn enable(
        &mut self,
        reference: DeckId,
        follower: DeckId,
        decks: &[Deck; 2],
    ) -> MixResult<SyncStatus> {
        if reference == follower {
            return Err(MixError::invalid("a deck cannot sync to itself"));
        }
        let ref_deck = &decks[reference.index()];
        let Some(ref_bpm) = ref_deck.bpm() else {
            tracing::warn!(deck = %reference, "sync unavailable: no BPM");
            return Ok(SyncStatus::Unavailable { missing_bpm: reference });
        };
        if decks[follower.index()].bpm().is_none() {
            tracing::warn!(deck = %follower, "sync unavailable: no BPM");
            return Ok(SyncStatus::Unavailable { missing_bpm: follower });
        }

        let state = SyncState {
            reference,
            follower,
            lock_phase_seconds: ref_deck.position_secs().rem_euclid(60.0 / ref_bpm),
        };
        tracing::info!(%reference, %follower, lock_phase = state.lock_phase_seconds, "sync enabled");
        self.state = Some(state);
        Ok(SyncStatus::Enabled(state))
    }

    /// Stop nudging. Deck positions stay where they are.
    pub fn disable(&mut self, reason: SyncDisableReason) -> Option<SyncState> {
        let previous = self.state.take();
        if previous.is_some() {
            tracing::info!(?reason, "sync disabled");
        }
        previous
    }

    /// Disable if `deck` takes part in the current relationship
    pub fn on_deck_stopped(&mut self, deck: DeckId) -> Option<SyncState> {
        match self.state {
            Some(s) if s.reference == deck || s.follower == deck => {
                self.disable(SyncDisableReason::DeckStopped(deck))
            }
            _ => None,
        }
    }

    /// One correction step. Returns the nudge applied to the follower, if any.
    pub fn tick(&mut self, decks: &mut [Deck; 2]) -> Option<f64> {
        let state = self.state?;

        // Read both positions before writing anything
        let (reference, follower) = (&decks[state.reference.index()], &decks[state.follower.index()]);
        if !(reference.is_playing() && follower.is_playing()) {
            return None;
        }
        let (Some(ref_bpm), Some(fol_bpm)) = (reference.bpm(), follower.bpm()) else {
            return None;
        };
        let error = phase_error(
            follower.position_secs(),
            fol_bpm,
            reference.position_secs(),
            ref_bpm,
        );

        if error.abs() <= self.tolerance {
            return None;
        }
        let correction = -error * self.correction_rate;
        decks[state.follower.index()].nudge_position(correction);
        tracing::trace!(error, correction, "sync nudge");
        Some(correction)
    }
}
