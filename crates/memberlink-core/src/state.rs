//! State machine types.

use serde::{Deserialize, Serialize};

/// Participant-level liveness classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Waiting for a candidate to confirm data.
    #[default]
    Pending,

    /// Media is confirmed flowing.
    Active,

    /// Media stopped on an enabled track; recovery watchdog running.
    Away,

    /// The participant has no streams left.
    Removed,
}

impl ConnectionState {
    /// Returns true if the member is confirmed live.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Away => "Away",
            Self::Removed => "Removed",
        }
    }
}

/// Playback state of a time shift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeShiftState {
    /// Created, no seek issued yet.
    #[default]
    Idle,

    /// Seek issued (or retry pending), waiting for readiness.
    Starting,

    /// Ready to play from the requested point.
    Ready,

    /// Playing.
    Playing,

    /// Paused.
    Paused,

    /// A seek request is in flight.
    Seeking,

    /// The last seek landed; transport stays paused.
    SeekingSucceeded,

    /// Playback reached the end.
    Ended,

    /// Terminal until the time shift is recreated.
    Failed,
}

impl TimeShiftState {
    /// States from which `play` and `play_loop` are accepted.
    pub fn can_play(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Paused | Self::Ended | Self::SeekingSucceeded
        )
    }

    /// States from which `pause` is accepted.
    pub fn can_pause(self) -> bool {
        matches!(self, Self::Playing)
    }

    /// States from which `stop` is accepted.
    pub fn can_stop(self) -> bool {
        matches!(
            self,
            Self::Playing | Self::Paused | Self::Seeking | Self::SeekingSucceeded | Self::Ended
        )
    }

    /// States from which `seek` is accepted.
    pub fn can_seek(self) -> bool {
        self.can_stop()
    }

    /// Readiness flips from the renderer are meaningless in these states.
    pub fn ignores_readiness(self) -> bool {
        matches!(self, Self::Playing | Self::Seeking | Self::Failed)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Seeking => "Seeking",
            Self::SeekingSucceeded => "SeekingSucceeded",
            Self::Ended => "Ended",
            Self::Failed => "Failed",
        }
    }
}
