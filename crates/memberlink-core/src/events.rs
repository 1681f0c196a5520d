//! Events published to the feature layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TimeShiftError;
use crate::state::{ConnectionState, TimeShiftState};
use crate::types::{MemberId, StreamUri, TimeShiftAlias};

/// Events emitted by member subscription controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberEvent {
    /// Connection state has changed.
    ConnectionStateChanged {
        member: MemberId,
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// A candidate confirmed data and its subscriptions went live.
    SubscriptionsReceived {
        member: MemberId,
        stream: StreamUri,
        count: usize,
    },

    /// A candidate was marked failed and will not be retried this cycle.
    CandidateFailed {
        member: MemberId,
        stream: StreamUri,
        reason: String,
    },

    /// No subscribable candidate remains; waiting for the next stream list.
    CandidatesExhausted { member: MemberId },
}

/// Events emitted by time shifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeShiftEvent {
    /// Playback state has changed.
    StateChanged {
        alias: TimeShiftAlias,
        previous: TimeShiftState,
        current: TimeShiftState,
    },

    /// Throttled playback head position.
    PlaybackHead {
        alias: TimeShiftAlias,
        position: Duration,
    },

    /// An operation was rejected or failed.
    Error {
        alias: TimeShiftAlias,
        error: TimeShiftError,
    },
}

impl TimeShiftEvent {
    pub fn alias(&self) -> &TimeShiftAlias {
        match self {
            Self::StateChanged { alias, .. }
            | Self::PlaybackHead { alias, .. }
            | Self::Error { alias, .. } => alias,
        }
    }
}
