//! Handles for subscriptions produced by the service.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use memberlink_core::{MediaKind, StreamToken, StreamUri};
use memberlink_engine::{MediaSubscription, MediaTrack, Renderer};

struct Inner {
    id: Uuid,
    stream: StreamUri,
    token: StreamToken,
    handle: Arc<dyn MediaSubscription>,
    disposed: AtomicBool,
}

/// A subscription to one token of one candidate stream.
///
/// Identity is a generated UUID: several subscriptions may target the same
/// candidate with different tokens. Clones share the same underlying
/// subscription; disposal happens once no matter how many clones call it.
#[derive(Clone)]
pub struct LiveSubscription {
    inner: Arc<Inner>,
}

impl LiveSubscription {
    pub(crate) fn new(
        stream: StreamUri,
        token: StreamToken,
        handle: Arc<dyn MediaSubscription>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                stream,
                token,
                handle,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn stream(&self) -> &StreamUri {
        &self.inner.stream
    }

    pub fn token(&self) -> &StreamToken {
        &self.inner.token
    }

    /// Whether this subscription carries media of `kind`.
    pub fn carries(&self, kind: MediaKind) -> bool {
        self.inner.token.covers(kind)
    }

    pub fn handle(&self) -> &Arc<dyn MediaSubscription> {
        &self.inner.handle
    }

    pub fn renderer(&self) -> Arc<dyn Renderer> {
        self.inner.handle.renderer()
    }

    pub fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.inner.handle.video_tracks()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Release the engine subscription. Later calls are no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.inner.id, stream = %self.inner.stream, "Disposing subscription");
        self.inner.handle.dispose();
    }
}

impl PartialEq for LiveSubscription {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LiveSubscription {}

impl fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("id", &self.inner.id)
            .field("stream", &self.inner.stream)
            .field("token", &self.inner.token.name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use memberlink_core::{DataQuality, StreamCandidate};
    use memberlink_engine::sim::SimulatedEngine;
    use memberlink_engine::MediaEngine;

    use super::*;

    #[tokio::test]
    async fn dispose_reaches_engine_once() {
        let engine = SimulatedEngine::new();
        let token = StreamToken::Audio("a".into());
        let candidate = StreamCandidate::new("s", vec![token.clone()]);
        let handle = engine.subscribe(&candidate, &token).await.unwrap().unwrap();

        let live = LiveSubscription::new(candidate.uri.clone(), token, handle);
        let clone = live.clone();
        live.dispose();
        clone.dispose();

        assert!(live.is_disposed());
        assert_eq!(engine.subscriptions_for("s")[0].dispose_count(), 1);
        assert_eq!(
            *live.handle().observe_data_quality().borrow(),
            DataQuality::All
        );
    }
}
