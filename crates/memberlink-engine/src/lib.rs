//! Media engine capability boundary.
//!
//! The real-time media engine (transport, decode, render) is an external
//! collaborator. This crate describes the slice of it that subscription
//! arbitration and time shifting consume, and ships a deterministic
//! in-process [`sim`] engine for tests and the simulator binary.
//!
//! All asynchronous operations complete through `tokio::sync::oneshot`
//! receivers; continuous signals are `watch` (state-like, replay last) or
//! `broadcast` (discrete events) receivers.

mod error;
mod frame;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};

use memberlink_core::{
    DataQuality, EngineStatus, MediaKind, PointInTime, SeekOrigin, StreamCandidate,
    StreamEndedReason, StreamToken,
};

pub use error::EngineError;
pub use frame::{VideoFrame, VideoSink};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Pending answer to a subscribe call.
pub type SubscribeResponse = oneshot::Receiver<EngineResult<Arc<dyn MediaSubscription>>>;

/// Pending answer to a transport call.
pub type StatusResponse = oneshot::Receiver<EngineStatus>;

/// Entry point of the media engine.
pub trait MediaEngine: Send + Sync {
    /// Subscribe to one track type of a candidate stream.
    fn subscribe(&self, candidate: &StreamCandidate, token: &StreamToken) -> SubscribeResponse;
}

/// A successful subscription to one candidate with one token.
pub trait MediaSubscription: Send + Sync {
    fn renderer(&self) -> Arc<dyn Renderer>;

    fn audio_tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// Decoder data quality; the current value is replayed to new observers.
    fn observe_data_quality(&self) -> watch::Receiver<DataQuality>;

    /// `Some(reason)` once the stream has ended.
    fn observe_stream_ended(&self) -> watch::Receiver<Option<StreamEndedReason>>;

    /// Release transport resources. Must tolerate repeated calls.
    fn dispose(&self);
}

/// A single media track of a subscription.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Cap the track bitrate; `None` lifts the cap.
    fn limit_bandwidth(&self, bits_per_second: Option<u64>);
}

/// Renders a subscription and gives access to time shifting.
pub trait Renderer: Send + Sync {
    /// Start rendering, optionally delivering video frames to `sink`.
    fn start(&self, sink: Option<Arc<dyn VideoSink>>);

    fn stop(&self);

    fn is_seekable(&self) -> bool;

    /// Create a time-shift handle positioned at `point`.
    fn seek(&self, point: &PointInTime) -> Option<Arc<dyn TimeShiftHandle>>;
}

/// Engine-side time-shift transport.
pub trait TimeShiftHandle: Send + Sync {
    fn observe_ready_for_playback(&self) -> watch::Receiver<bool>;

    fn observe_playback_head(&self) -> watch::Receiver<Duration>;

    /// Non-OK statuses signal that the shifted stream failed.
    fn observe_failure(&self) -> broadcast::Receiver<EngineStatus>;

    fn observe_ended(&self) -> watch::Receiver<bool>;

    fn play(&self) -> StatusResponse;

    fn play_loop(&self, duration: Duration) -> StatusResponse;

    fn pause(&self) -> StatusResponse;

    fn stop(&self) -> StatusResponse;

    fn seek(&self, offset: Duration, origin: SeekOrigin) -> StatusResponse;

    fn limit_bandwidth(&self, bits_per_second: Option<u64>);

    /// Release the handle. Must tolerate repeated calls.
    fn dispose(&self);
}
