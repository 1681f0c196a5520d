//! Simulated engine and subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use memberlink_core::{
    DataQuality, EngineStatus, MediaKind, StreamCandidate, StreamEndedReason, StreamToken,
    StreamUri,
};

use crate::sim::renderer::SimulatedRenderer;
use crate::{
    EngineError, EngineResult, MediaEngine, MediaSubscription, MediaTrack, Renderer,
    SubscribeResponse,
};

/// Scripted outcome of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeScript {
    /// Answer immediately with a subscription reporting this quality.
    Succeed(DataQuality),

    /// Answer immediately with a failure.
    Fail(EngineStatus),

    /// Keep the call pending until [`SimulatedEngine::resolve_held`].
    Hold,
}

struct HeldAttempt {
    uri: StreamUri,
    token: StreamToken,
    responder: oneshot::Sender<EngineResult<Arc<dyn MediaSubscription>>>,
}

struct EngineState {
    scripts: HashMap<StreamUri, SubscribeScript>,
    default_script: SubscribeScript,
    seekable: bool,
    held: Vec<HeldAttempt>,
    attempts: Vec<(StreamUri, StreamToken)>,
    subscriptions: Vec<Arc<SimulatedSubscription>>,
}

/// A media engine whose behaviour is scripted per stream URI.
#[derive(Clone)]
pub struct SimulatedEngine {
    state: Arc<Mutex<EngineState>>,
    next_id: Arc<AtomicU64>,
}

impl SimulatedEngine {
    /// Create an engine where every subscription succeeds with full quality.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                scripts: HashMap::new(),
                default_script: SubscribeScript::Succeed(DataQuality::All),
                seekable: true,
                held: Vec::new(),
                attempts: Vec::new(),
                subscriptions: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Script the outcome of every subscribe call for `uri`.
    pub fn script(&self, uri: &str, script: SubscribeScript) {
        self.state.lock().scripts.insert(StreamUri::new(uri), script);
    }

    /// Outcome for streams without a specific script.
    pub fn set_default_script(&self, script: SubscribeScript) {
        self.state.lock().default_script = script;
    }

    /// Whether renderers of new subscriptions can seek.
    pub fn set_seekable(&self, seekable: bool) {
        self.state.lock().seekable = seekable;
    }

    /// Every subscribe call in order.
    pub fn attempts(&self) -> Vec<(StreamUri, StreamToken)> {
        self.state.lock().attempts.clone()
    }

    /// Stream URIs in the order they were first attempted.
    pub fn attempted_uris(&self) -> Vec<StreamUri> {
        let state = self.state.lock();
        let mut uris: Vec<StreamUri> = Vec::new();
        for (uri, _) in &state.attempts {
            if uris.last() != Some(uri) {
                uris.push(uri.clone());
            }
        }
        uris
    }

    /// Every subscription handed out so far, including disposed ones.
    pub fn subscriptions(&self) -> Vec<Arc<SimulatedSubscription>> {
        self.state.lock().subscriptions.clone()
    }

    pub fn subscriptions_for(&self, uri: &str) -> Vec<Arc<SimulatedSubscription>> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.uri.as_str() == uri)
            .cloned()
            .collect()
    }

    /// Number of subscribe calls waiting for [`Self::resolve_held`].
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Answer held calls for `uri` with `outcome`. Returns how many were answered.
    ///
    /// `SubscribeScript::Hold` as an outcome is treated as a cancellation.
    pub fn resolve_held(&self, uri: &str, outcome: SubscribeScript) -> usize {
        let held: Vec<HeldAttempt> = {
            let mut state = self.state.lock();
            let (matching, rest) = std::mem::take(&mut state.held)
                .into_iter()
                .partition(|h| h.uri.as_str() == uri);
            state.held = rest;
            matching
        };

        let count = held.len();
        for attempt in held {
            self.answer(attempt, outcome);
        }
        count
    }

    /// Answer only the oldest held call for `uri`. Returns false if none was held.
    pub fn resolve_next_held(&self, uri: &str, outcome: SubscribeScript) -> bool {
        let attempt = {
            let mut state = self.state.lock();
            match state.held.iter().position(|h| h.uri.as_str() == uri) {
                Some(index) => state.held.remove(index),
                None => return false,
            }
        };
        self.answer(attempt, outcome);
        true
    }

    fn answer(&self, attempt: HeldAttempt, outcome: SubscribeScript) {
        let result = match outcome {
            SubscribeScript::Succeed(quality) => {
                Ok(self.create_subscription(&attempt.uri, &attempt.token, quality))
            }
            SubscribeScript::Fail(status) => Err(EngineError::SubscribeFailed(status)),
            SubscribeScript::Hold => Err(EngineError::Cancelled),
        };
        let _ = attempt.responder.send(result);
    }

    fn create_subscription(
        &self,
        uri: &StreamUri,
        token: &StreamToken,
        quality: DataQuality,
    ) -> Arc<dyn MediaSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seekable = self.state.lock().seekable;
        let subscription = Arc::new(SimulatedSubscription::new(
            id,
            uri.clone(),
            token.clone(),
            quality,
            Arc::new(SimulatedRenderer::new(seekable)),
        ));
        self.state.lock().subscriptions.push(Arc::clone(&subscription));
        subscription
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for SimulatedEngine {
    fn subscribe(&self, candidate: &StreamCandidate, token: &StreamToken) -> SubscribeResponse {
        let (tx, rx) = oneshot::channel();

        let script = {
            let mut state = self.state.lock();
            state.attempts.push((candidate.uri.clone(), token.clone()));
            state
                .scripts
                .get(&candidate.uri)
                .copied()
                .unwrap_or(state.default_script)
        };

        debug!(uri = %candidate.uri, token = token.name(), ?script, "Simulated subscribe");

        match script {
            SubscribeScript::Succeed(quality) => {
                let subscription = self.create_subscription(&candidate.uri, token, quality);
                let _ = tx.send(Ok(subscription));
            }
            SubscribeScript::Fail(status) => {
                let _ = tx.send(Err(EngineError::SubscribeFailed(status)));
            }
            SubscribeScript::Hold => {
                self.state.lock().held.push(HeldAttempt {
                    uri: candidate.uri.clone(),
                    token: token.clone(),
                    responder: tx,
                });
            }
        }

        rx
    }
}

/// A simulated subscription with injectable quality and end signals.
pub struct SimulatedSubscription {
    pub id: u64,
    pub uri: StreamUri,
    pub token: StreamToken,
    quality: watch::Sender<DataQuality>,
    ended: watch::Sender<Option<StreamEndedReason>>,
    renderer: Arc<SimulatedRenderer>,
    audio: Vec<Arc<SimulatedTrack>>,
    video: Vec<Arc<SimulatedTrack>>,
    disposals: AtomicU32,
}

impl SimulatedSubscription {
    fn new(
        id: u64,
        uri: StreamUri,
        token: StreamToken,
        quality: DataQuality,
        renderer: Arc<SimulatedRenderer>,
    ) -> Self {
        let audio = if token.covers(MediaKind::Audio) {
            vec![Arc::new(SimulatedTrack::new(format!("{id}-audio"), MediaKind::Audio))]
        } else {
            Vec::new()
        };
        let video = if token.covers(MediaKind::Video) {
            vec![Arc::new(SimulatedTrack::new(format!("{id}-video"), MediaKind::Video))]
        } else {
            Vec::new()
        };

        Self {
            id,
            uri,
            token,
            quality: watch::channel(quality).0,
            ended: watch::channel(None).0,
            renderer,
            audio,
            video,
            disposals: AtomicU32::new(0),
        }
    }

    pub fn set_quality(&self, quality: DataQuality) {
        self.quality.send_replace(quality);
    }

    pub fn end(&self, reason: StreamEndedReason) {
        self.ended.send_replace(Some(reason));
    }

    pub fn simulated_renderer(&self) -> Arc<SimulatedRenderer> {
        Arc::clone(&self.renderer)
    }

    pub fn simulated_video_tracks(&self) -> Vec<Arc<SimulatedTrack>> {
        self.video.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose_count() > 0
    }

    /// How many times `dispose` was called.
    pub fn dispose_count(&self) -> u32 {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl MediaSubscription for SimulatedSubscription {
    fn renderer(&self) -> Arc<dyn Renderer> {
        Arc::clone(&self.renderer) as Arc<dyn Renderer>
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.audio
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn MediaTrack>)
            .collect()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.video
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn MediaTrack>)
            .collect()
    }

    fn observe_data_quality(&self) -> watch::Receiver<DataQuality> {
        self.quality.subscribe()
    }

    fn observe_stream_ended(&self) -> watch::Receiver<Option<StreamEndedReason>> {
        self.ended.subscribe()
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.renderer.stop();
    }
}

/// A simulated track recording its bandwidth limit.
pub struct SimulatedTrack {
    id: String,
    kind: MediaKind,
    bandwidth: Mutex<Option<u64>>,
}

impl SimulatedTrack {
    fn new(id: String, kind: MediaKind) -> Self {
        Self {
            id,
            kind,
            bandwidth: Mutex::new(None),
        }
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        *self.bandwidth.lock()
    }
}

impl MediaTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn limit_bandwidth(&self, bits_per_second: Option<u64>) {
        *self.bandwidth.lock() = bits_per_second;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(uri: &str) -> StreamCandidate {
        StreamCandidate::new(uri, vec![StreamToken::Universal("u".into())])
    }

    #[tokio::test]
    async fn scripted_failure_is_reported() {
        let engine = SimulatedEngine::new();
        engine.script("a", SubscribeScript::Fail(EngineStatus::NotFound));

        let token = StreamToken::Audio("t".into());
        let result = engine.subscribe(&candidate("a"), &token).await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::SubscribeFailed(EngineStatus::NotFound))
        ));
        assert_eq!(engine.attempts(), vec![(StreamUri::new("a"), token)]);
    }

    #[tokio::test]
    async fn held_attempts_resolve_on_demand() {
        let engine = SimulatedEngine::new();
        engine.script("a", SubscribeScript::Hold);

        let mut rx = engine.subscribe(&candidate("a"), &StreamToken::Video("v".into()));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.held_count(), 1);

        assert_eq!(engine.resolve_held("a", SubscribeScript::Succeed(DataQuality::NoData)), 1);
        let subscription = rx.await.unwrap().unwrap();
        assert_eq!(*subscription.observe_data_quality().borrow(), DataQuality::NoData);
        assert_eq!(subscription.video_tracks().len(), 1);
        assert!(subscription.audio_tracks().is_empty());
        assert_eq!(engine.held_count(), 0);
    }

    #[tokio::test]
    async fn dispose_is_counted() {
        let engine = SimulatedEngine::new();
        let subscription = engine
            .subscribe(&candidate("a"), &StreamToken::Universal("u".into()))
            .await
            .unwrap()
            .unwrap();
        subscription.dispose();

        let simulated = &engine.subscriptions_for("a")[0];
        assert_eq!(simulated.dispose_count(), 1);
        assert!(!simulated.simulated_renderer().is_started());
    }
}
