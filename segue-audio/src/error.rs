//! Error types for the mixing engine

use crate::track::LoadError;
use thiserror::Error;

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum MixError {
    /// Track could not be opened; the deck keeps its previous track
    #[error("load failed: {0}")]
    LoadFailure(#[from] LoadError),
    /// Rejected before any state was touched
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A recording session is already in flight
    #[error("a recording session is already active")]
    ConcurrentSessionConflict,
    /// The capture path failed mid-session; partial data was discarded
    #[error("capture engine failure: {0}")]
    CaptureEngineFailure(String),
}

impl MixError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MixError::InvalidParameter(msg.into())
    }
}

/// Result alias for engine operations
pub type MixResult<T> = Result<T, MixError>;
