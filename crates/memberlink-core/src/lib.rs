//! Shared types for member subscription arbitration and time shifting.
//!
//! This crate defines the value types, state machines, events and errors
//! used between the subscription and time-shift crates and the feature
//! layer that observes them.

mod config;
mod error;
mod events;
mod state;
mod types;
mod watchdog;

pub use config::{MemberlinkConfig, SubscriptionConfig, TimeShiftConfig};
pub use error::{ConfigError, EngineStatus, TimeShiftError};
pub use events::{MemberEvent, TimeShiftEvent};
pub use state::{ConnectionState, TimeShiftState};
pub use types::{
    BandwidthTarget, DataQuality, MediaKind, MemberId, PointInTime, SeekOrigin, StreamCandidate,
    StreamEndedReason, StreamToken, StreamUri, TimeShiftAlias,
};
pub use watchdog::Watchdog;

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for member events.
pub const MEMBER_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for time-shift events.
pub const TIME_SHIFT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded member event channel.
pub fn member_event_channel() -> (Sender<MemberEvent>, Receiver<MemberEvent>) {
    crossbeam_channel::bounded(MEMBER_EVENT_CHANNEL_CAPACITY)
}

/// Creates a bounded time-shift event channel.
pub fn time_shift_event_channel() -> (Sender<TimeShiftEvent>, Receiver<TimeShiftEvent>) {
    crossbeam_channel::bounded(TIME_SHIFT_EVENT_CHANNEL_CAPACITY)
}
