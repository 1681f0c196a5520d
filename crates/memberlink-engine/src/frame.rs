//! Decoded video frames delivered to sinks.

use std::time::Duration;

use bytes::Bytes;

/// A decoded video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame pixels in the renderer's output format.
    pub data: Bytes,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Presentation timestamp relative to the stream start.
    pub timestamp: Duration,
}

/// Receives frames from a renderer.
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}
