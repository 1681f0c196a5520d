//! Simulated renderer and time-shift transport.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

use memberlink_core::{EngineStatus, PointInTime, SeekOrigin};

use crate::{Renderer, StatusResponse, TimeShiftHandle, VideoFrame, VideoSink};

/// Capacity of the failure broadcast.
const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// A renderer that records what was asked of it.
pub struct SimulatedRenderer {
    seekable: AtomicBool,
    provides_time_shift: AtomicBool,
    started: AtomicBool,
    sink: Mutex<Option<Arc<dyn VideoSink>>>,
    time_shifts: Mutex<Vec<Arc<SimulatedTimeShift>>>,
}

impl SimulatedRenderer {
    pub fn new(seekable: bool) -> Self {
        Self {
            seekable: AtomicBool::new(seekable),
            provides_time_shift: AtomicBool::new(true),
            started: AtomicBool::new(false),
            sink: Mutex::new(None),
            time_shifts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_seekable(&self, seekable: bool) {
        self.seekable.store(seekable, Ordering::SeqCst);
    }

    /// When false, `seek` returns no handle.
    pub fn set_provides_time_shift(&self, provides: bool) {
        self.provides_time_shift.store(provides, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Hand a frame to the attached sink. Returns false if there is none.
    pub fn render_frame(&self, frame: VideoFrame) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.on_frame(frame);
                true
            }
            None => false,
        }
    }

    /// Number of `seek` calls that produced a handle.
    pub fn seek_count(&self) -> usize {
        self.time_shifts.lock().len()
    }

    pub fn time_shifts(&self) -> Vec<Arc<SimulatedTimeShift>> {
        self.time_shifts.lock().clone()
    }

    /// The most recently created time-shift handle.
    pub fn latest_time_shift(&self) -> Option<Arc<SimulatedTimeShift>> {
        self.time_shifts.lock().last().cloned()
    }
}

impl Renderer for SimulatedRenderer {
    fn start(&self, sink: Option<Arc<dyn VideoSink>>) {
        self.started.store(true, Ordering::SeqCst);
        if sink.is_some() {
            *self.sink.lock() = sink;
        }
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.sink.lock().take();
    }

    fn is_seekable(&self) -> bool {
        self.seekable.load(Ordering::SeqCst)
    }

    fn seek(&self, point: &PointInTime) -> Option<Arc<dyn TimeShiftHandle>> {
        if !self.provides_time_shift.load(Ordering::SeqCst) {
            return None;
        }
        let handle = Arc::new(SimulatedTimeShift::new(*point));
        self.time_shifts.lock().push(Arc::clone(&handle));
        debug!(?point, "Simulated time shift created");
        Some(handle)
    }
}

/// A transport call received by a simulated time shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    Play,
    Loop(Duration),
    Pause,
    Stop,
    Seek { offset: Duration, origin: SeekOrigin },
}

/// Time-shift transport with injectable signals.
pub struct SimulatedTimeShift {
    pub point: PointInTime,
    ready: watch::Sender<bool>,
    head: watch::Sender<Duration>,
    failure: broadcast::Sender<EngineStatus>,
    ended: watch::Sender<bool>,
    status: Mutex<EngineStatus>,
    calls: Mutex<Vec<TransportCall>>,
    bandwidth: Mutex<Option<u64>>,
    disposals: AtomicU32,
}

impl SimulatedTimeShift {
    fn new(point: PointInTime) -> Self {
        Self {
            point,
            ready: watch::channel(false).0,
            head: watch::channel(Duration::ZERO).0,
            failure: broadcast::channel(FAILURE_CHANNEL_CAPACITY).0,
            ended: watch::channel(false).0,
            status: Mutex::new(EngineStatus::Ok),
            calls: Mutex::new(Vec::new()),
            bandwidth: Mutex::new(None),
            disposals: AtomicU32::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn set_playback_head(&self, position: Duration) {
        self.head.send_replace(position);
    }

    /// Raise the failure signal.
    pub fn fail(&self, status: EngineStatus) {
        let _ = self.failure.send(status);
    }

    pub fn set_ended(&self, ended: bool) {
        self.ended.send_replace(ended);
    }

    /// Status returned by subsequent transport calls.
    pub fn set_transport_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        *self.bandwidth.lock()
    }

    pub fn dispose_count(&self) -> u32 {
        self.disposals.load(Ordering::SeqCst)
    }

    fn record(&self, call: TransportCall) -> StatusResponse {
        self.calls.lock().push(call);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(*self.status.lock());
        rx
    }
}

impl TimeShiftHandle for SimulatedTimeShift {
    fn observe_ready_for_playback(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn observe_playback_head(&self) -> watch::Receiver<Duration> {
        self.head.subscribe()
    }

    fn observe_failure(&self) -> broadcast::Receiver<EngineStatus> {
        self.failure.subscribe()
    }

    fn observe_ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    fn play(&self) -> StatusResponse {
        self.record(TransportCall::Play)
    }

    fn play_loop(&self, duration: Duration) -> StatusResponse {
        self.record(TransportCall::Loop(duration))
    }

    fn pause(&self) -> StatusResponse {
        self.record(TransportCall::Pause)
    }

    fn stop(&self) -> StatusResponse {
        self.record(TransportCall::Stop)
    }

    fn seek(&self, offset: Duration, origin: SeekOrigin) -> StatusResponse {
        self.record(TransportCall::Seek { offset, origin })
    }

    fn limit_bandwidth(&self, bits_per_second: Option<u64>) {
        *self.bandwidth.lock() = bits_per_second;
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_calls_are_recorded_with_scripted_status() {
        let renderer = SimulatedRenderer::new(true);
        let handle = renderer
            .seek(&PointInTime::Seek {
                offset: Duration::from_secs(30),
                origin: SeekOrigin::End,
            })
            .unwrap();
        let simulated = renderer.latest_time_shift().unwrap();

        assert_eq!(handle.play().await.unwrap(), EngineStatus::Ok);
        simulated.set_transport_status(EngineStatus::Conflict);
        assert_eq!(handle.pause().await.unwrap(), EngineStatus::Conflict);

        assert_eq!(simulated.calls(), vec![TransportCall::Play, TransportCall::Pause]);
        assert_eq!(renderer.seek_count(), 1);
    }

    #[test]
    fn frames_reach_the_started_sink() {
        struct CountingSink(AtomicU32);

        impl VideoSink for CountingSink {
            fn on_frame(&self, _frame: VideoFrame) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let frame = VideoFrame {
            data: bytes::Bytes::from_static(&[0u8; 16]),
            width: 4,
            height: 1,
            timestamp: Duration::ZERO,
        };
        let renderer = SimulatedRenderer::new(false);
        assert!(!renderer.render_frame(frame.clone()));

        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        renderer.start(Some(Arc::clone(&sink) as Arc<dyn VideoSink>));
        assert!(renderer.render_frame(frame.clone()));
        renderer.stop();
        assert!(!renderer.render_frame(frame));
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renderer_without_time_shift_returns_none() {
        let renderer = SimulatedRenderer::new(true);
        renderer.set_provides_time_shift(false);
        assert!(renderer
            .seek(&PointInTime::Timestamp(std::time::SystemTime::now()))
            .is_none());
        assert_eq!(renderer.seek_count(), 0);
    }

    #[tokio::test]
    async fn failure_signal_reaches_observers() {
        let renderer = SimulatedRenderer::new(true);
        let handle = renderer
            .seek(&PointInTime::Timestamp(std::time::SystemTime::now()))
            .unwrap();
        let mut failures = handle.observe_failure();

        renderer.latest_time_shift().unwrap().fail(EngineStatus::Timeout);
        assert_eq!(failures.recv().await.unwrap(), EngineStatus::Timeout);
    }
}
