//! Common value types shared by the subscription and time-shift crates.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Identifier of a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which a time shift is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeShiftAlias(pub String);

impl TimeShiftAlias {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimeShiftAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of a candidate stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamUri(pub String);

impl StreamUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Which track type a subscription attempt targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamToken {
    /// Audio-only access token.
    Audio(String),

    /// Video-only access token.
    Video(String),

    /// Token granting both audio and video.
    Universal(String),
}

impl StreamToken {
    /// The raw token value handed to the media engine.
    pub fn value(&self) -> &str {
        match self {
            Self::Audio(token) | Self::Video(token) | Self::Universal(token) => token,
        }
    }

    /// Returns true if this token carries media of the given kind.
    pub fn covers(&self, kind: MediaKind) -> bool {
        match self {
            Self::Audio(_) => kind == MediaKind::Audio,
            Self::Video(_) => kind == MediaKind::Video,
            Self::Universal(_) => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Video(_) => "video",
            Self::Universal(_) => "universal",
        }
    }
}

/// One of a participant's concurrently published streams.
///
/// Two candidates are the same candidate when their URIs match; the token
/// list is metadata and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCandidate {
    /// Stream identity.
    pub uri: StreamUri,

    /// Tokens this stream can be subscribed with.
    pub tokens: Vec<StreamToken>,
}

impl StreamCandidate {
    pub fn new(uri: impl Into<String>, tokens: Vec<StreamToken>) -> Self {
        Self {
            uri: StreamUri::new(uri),
            tokens,
        }
    }
}

impl PartialEq for StreamCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for StreamCandidate {}

impl Hash for StreamCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

/// Data quality reported by the decoder for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataQuality {
    /// Nothing is arriving.
    #[default]
    NoData,

    /// Only audio is arriving.
    AudioOnly,

    /// Audio and video are arriving.
    All,
}

impl DataQuality {
    /// Returns true if the subscription is delivering media.
    pub fn is_producing(self) -> bool {
        matches!(self, Self::AudioOnly | Self::All)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoData => "no-data",
            Self::AudioOnly => "audio-only",
            Self::All => "all",
        }
    }
}

/// Why a subscribed stream stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEndedReason {
    /// The publisher ended the stream.
    Ended,

    /// The stream failed on the origin side.
    Failed,

    /// The stream was taken down.
    Censored,

    /// The origin is being maintained.
    Maintenance,

    /// Any other engine-specific reason.
    Custom(String),
}

impl fmt::Display for StreamEndedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ended => f.write_str("ended"),
            Self::Failed => f.write_str("failed"),
            Self::Censored => f.write_str("censored"),
            Self::Maintenance => f.write_str("maintenance"),
            Self::Custom(reason) => write!(f, "custom: {reason}"),
        }
    }
}

/// Reference point for a relative seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekOrigin {
    Beginning,
    Current,
    End,
}

/// Where a time shift should start playing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointInTime {
    /// Absolute wall-clock timestamp.
    Timestamp(SystemTime),

    /// Offset relative to an origin.
    Seek { offset: Duration, origin: SeekOrigin },
}

impl PointInTime {
    /// Returns true for relative (offset + origin) points in time.
    pub fn is_relative(&self) -> bool {
        matches!(self, Self::Seek { .. })
    }
}

/// Anything that accepts bandwidth limits pushed from a member or stream handle.
pub trait BandwidthTarget: Send + Sync {
    /// Cap the bitrate (bits per second); `None` lifts the limit.
    fn limit_bandwidth(&self, bits_per_second: Option<u64>);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn candidates_compare_by_uri_only() {
        let a = StreamCandidate::new("pcast://a", vec![StreamToken::Audio("t1".into())]);
        let b = StreamCandidate::new("pcast://a", vec![StreamToken::Video("t2".into())]);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn universal_token_covers_both_kinds() {
        let token = StreamToken::Universal("u".into());
        assert!(token.covers(MediaKind::Audio));
        assert!(token.covers(MediaKind::Video));
        assert!(!StreamToken::Audio("a".into()).covers(MediaKind::Video));
    }

    #[test]
    fn only_audio_and_all_are_producing() {
        assert!(!DataQuality::NoData.is_producing());
        assert!(DataQuality::AudioOnly.is_producing());
        assert!(DataQuality::All.is_producing());
    }
}
