//! Error and status types shared across crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TimeShiftState;

/// Completion status of an asynchronous media engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineStatus {
    Ok,
    Failed,
    Timeout,
    NotFound,
    Unauthorized,
    Conflict,
}

impl EngineStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::NotFound => "not-found",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors reported by time-shift operations.
///
/// None of these are fatal: rejections leave the time shift untouched, and
/// `RetriesExhausted` leaves it in `Failed` until it is recreated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TimeShiftError {
    /// The renderer cannot seek.
    #[error("Renderer is not seekable")]
    NotSeekable,

    /// The renderer refused to create a time-shift handle.
    #[error("Renderer did not provide a time shift")]
    CreationFailed,

    /// No time shift is registered for the alias.
    #[error("No time shift for alias {0}")]
    NotFound(String),

    #[error("Playing not allowed from current state: {0:?}")]
    PlayingNotAllowed(TimeShiftState),

    #[error("Pausing not allowed from current state: {0:?}")]
    PausingNotAllowed(TimeShiftState),

    #[error("Stopping not allowed from current state: {0:?}")]
    StoppingNotAllowed(TimeShiftState),

    #[error("Seeking not allowed from current state: {0:?}")]
    SeekingNotAllowed(TimeShiftState),

    /// A transport call completed with a non-OK status.
    #[error("Transport operation {operation} failed: {status}")]
    Transport {
        operation: String,
        status: EngineStatus,
    },

    /// Automatic retries are used up.
    #[error("Time shift failed after {0} retries")]
    RetriesExhausted(u32),

    /// The time shift has been disposed.
    #[error("Time shift disposed")]
    Disposed,
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
