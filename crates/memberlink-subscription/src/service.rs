//! Candidate subscription with liveness confirmation.
//!
//! The service never runs on its own: its owner feeds every [`ServiceMsg`]
//! it posts back into [`MemberSubscriptionService::handle`] from a single
//! serialized queue. Each candidate attempt carries a generation; messages
//! from superseded generations are dropped, and a subscription that
//! arrives after its attempt was abandoned is disposed on the spot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use memberlink_core::{
    DataQuality, MemberId, StreamCandidate, StreamEndedReason, StreamToken, StreamUri,
    SubscriptionConfig, Watchdog,
};
use memberlink_engine::{EngineError, EngineResult, MediaEngine, MediaSubscription};

use crate::live::LiveSubscription;
use crate::selector::next_candidate;

/// What to do with the candidate the selector offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeDecision {
    /// Subscribe to it.
    Subscribe,

    /// Try the next candidate instead.
    Skip,

    /// Abort the whole cycle.
    Stop,
}

/// Why a candidate was marked failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionFailure {
    #[error("Subscribe attempt failed: {0}")]
    AttemptFailed(EngineError),

    #[error("No tokens to subscribe with")]
    NoTokens,

    #[error("No data confirmed within {0:?}")]
    LivenessTimeout(Duration),
}

/// Owner-side hooks of the service.
pub trait SubscriptionServiceDelegate {
    /// Decide whether the offered candidate should be subscribed.
    fn should_subscribe(&mut self, candidate: &StreamCandidate) -> SubscribeDecision;

    /// Tokens to request for the candidate; one attempt runs per token.
    fn tokens_for(&mut self, candidate: &StreamCandidate) -> Vec<StreamToken>;

    /// One attempt succeeded; liveness is not confirmed yet.
    fn did_subscribe(&mut self, subscription: &LiveSubscription);

    /// The candidate was marked failed.
    fn did_fail(&mut self, candidate: &StreamCandidate, failure: &SubscriptionFailure);

    /// Every subscription of the candidate is producing data. Ownership of
    /// `subscriptions` passes to the delegate.
    fn did_receive_data(&mut self, candidate: &StreamCandidate, subscriptions: Vec<LiveSubscription>);

    /// No candidate is left to try.
    fn did_exhaust_candidates(&mut self);
}

/// Messages the service posts to its owner's queue.
pub enum ServiceMsg {
    AttemptResolved {
        generation: u64,
        token: StreamToken,
        result: EngineResult<Arc<dyn MediaSubscription>>,
    },
    QualityChanged {
        generation: u64,
        id: Uuid,
        quality: DataQuality,
    },
    StreamEnded {
        generation: u64,
        id: Uuid,
        reason: StreamEndedReason,
    },
    ConfirmationTimeout {
        watchdog: u64,
    },
}

/// Hands a message to the owner's queue.
pub type ServicePoster = Arc<dyn Fn(ServiceMsg) + Send + Sync>;

/// Attempts in flight for the selected candidate.
struct CandidateAttempt {
    candidate: StreamCandidate,
    generation: u64,
    outstanding: usize,
    failure: Option<SubscriptionFailure>,
    working: Vec<LiveSubscription>,
    quality: HashMap<Uuid, DataQuality>,
    monitors: Vec<JoinHandle<()>>,
}

impl CandidateAttempt {
    fn is_producing(&self) -> bool {
        !self.working.is_empty()
            && self.working.iter().all(|s| {
                self.quality
                    .get(&s.id())
                    .is_some_and(|quality| quality.is_producing())
            })
    }

    /// Stop monitoring and hand back the working set.
    fn finish(self) -> (StreamCandidate, Vec<LiveSubscription>) {
        for monitor in &self.monitors {
            monitor.abort();
        }
        (self.candidate, self.working)
    }
}

/// Subscribes a member's candidate streams one candidate at a time.
pub struct MemberSubscriptionService {
    member: MemberId,
    engine: Arc<dyn MediaEngine>,
    confirmation_timeout: Duration,
    post: ServicePoster,
    streams: Vec<StreamCandidate>,
    candidates: Vec<StreamCandidate>,
    failed: HashSet<StreamUri>,
    previous: Option<StreamCandidate>,
    attempt: Option<CandidateAttempt>,
    generation: u64,
    watchdog: Watchdog,
}

impl MemberSubscriptionService {
    pub fn new(
        member: MemberId,
        engine: Arc<dyn MediaEngine>,
        config: &SubscriptionConfig,
        post: ServicePoster,
    ) -> Self {
        Self {
            member,
            engine,
            confirmation_timeout: config.confirmation_timeout(),
            post,
            streams: Vec::new(),
            candidates: Vec::new(),
            failed: HashSet::new(),
            previous: None,
            attempt: None,
            generation: 0,
            watchdog: Watchdog::new("confirmation"),
        }
    }

    /// Replace the candidate pool and start a new cycle.
    ///
    /// Returns false if the pool is unchanged, in which case only the
    /// filtered candidate set is recomputed and the current cycle continues.
    #[instrument(name = "subscribe_streams", skip_all, fields(member = %self.member))]
    pub fn subscribe_streams(
        &mut self,
        streams: Vec<StreamCandidate>,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) -> bool {
        let unchanged = streams == self.streams;

        self.failed
            .retain(|uri| streams.iter().any(|stream| &stream.uri == uri));
        self.streams = streams;
        self.refilter();

        if unchanged {
            debug!("Candidate pool unchanged");
            return false;
        }

        info!(streams = self.streams.len(), failed = self.failed.len(), "Candidate pool replaced");
        self.restart(delegate);
        true
    }

    /// Start a fresh cycle on the current pool. Failed candidates stay excluded.
    pub fn restart(&mut self, delegate: &mut dyn SubscriptionServiceDelegate) {
        self.abandon_attempt();
        self.previous = None;
        self.refilter();
        self.attempt_next(delegate);
    }

    /// Forget everything, including the failure set.
    pub fn reset(&mut self) {
        self.abandon_attempt();
        self.streams.clear();
        self.candidates.clear();
        self.failed.clear();
        self.previous = None;
    }

    /// Process a message previously posted by this service.
    pub fn handle(&mut self, msg: ServiceMsg, delegate: &mut dyn SubscriptionServiceDelegate) {
        match msg {
            ServiceMsg::AttemptResolved {
                generation,
                token,
                result,
            } => self.on_attempt_resolved(generation, token, result, delegate),
            ServiceMsg::QualityChanged {
                generation,
                id,
                quality,
            } => self.on_quality_changed(generation, id, quality, delegate),
            ServiceMsg::StreamEnded {
                generation,
                id,
                reason,
            } => self.on_stream_ended(generation, id, reason, delegate),
            ServiceMsg::ConfirmationTimeout { watchdog } => {
                self.on_confirmation_timeout(watchdog, delegate)
            }
        }
    }

    /// The full candidate pool as last pushed.
    pub fn streams(&self) -> &[StreamCandidate] {
        &self.streams
    }

    /// URIs of candidates that failed and are excluded from selection.
    pub fn failed_streams(&self) -> &HashSet<StreamUri> {
        &self.failed
    }

    /// The candidate whose attempts are in flight, if any.
    pub fn current_candidate(&self) -> Option<&StreamCandidate> {
        self.attempt.as_ref().map(|a| &a.candidate)
    }

    fn refilter(&mut self) {
        self.candidates = self
            .streams
            .iter()
            .filter(|stream| !self.failed.contains(&stream.uri))
            .cloned()
            .collect();
    }

    fn attempt_next(&mut self, delegate: &mut dyn SubscriptionServiceDelegate) {
        let mut skips = 0usize;

        loop {
            let Some(candidate) = next_candidate(&self.candidates, self.previous.as_ref()) else {
                info!(member = %self.member, "No subscribable candidates left");
                delegate.did_exhaust_candidates();
                return;
            };
            self.previous = Some(candidate.clone());

            match delegate.should_subscribe(&candidate) {
                SubscribeDecision::Subscribe => {
                    self.subscribe_candidate(candidate, delegate);
                    return;
                }
                SubscribeDecision::Skip => {
                    debug!(member = %self.member, uri = %candidate.uri, "Skipping candidate");
                    skips += 1;
                    if skips >= self.candidates.len() {
                        info!(member = %self.member, skips, "Every candidate was skipped");
                        delegate.did_exhaust_candidates();
                        return;
                    }
                }
                SubscribeDecision::Stop => {
                    debug!(member = %self.member, "Subscription cycle stopped by delegate");
                    return;
                }
            }
        }
    }

    fn subscribe_candidate(
        &mut self,
        candidate: StreamCandidate,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        let tokens = delegate.tokens_for(&candidate);
        if tokens.is_empty() {
            self.fail_candidate(candidate, SubscriptionFailure::NoTokens, delegate);
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        info!(
            member = %self.member,
            uri = %candidate.uri,
            tokens = tokens.len(),
            generation,
            "Subscribing to candidate"
        );

        for token in &tokens {
            let response = self.engine.subscribe(&candidate, token);
            let post = Arc::clone(&self.post);
            let token = token.clone();
            tokio::spawn(async move {
                let result = response.await.unwrap_or(Err(EngineError::Cancelled));
                post(ServiceMsg::AttemptResolved {
                    generation,
                    token,
                    result,
                });
            });
        }

        self.attempt = Some(CandidateAttempt {
            candidate,
            generation,
            outstanding: tokens.len(),
            failure: None,
            working: Vec::new(),
            quality: HashMap::new(),
            monitors: Vec::new(),
        });
    }

    fn on_attempt_resolved(
        &mut self,
        generation: u64,
        token: StreamToken,
        result: EngineResult<Arc<dyn MediaSubscription>>,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        let Some(attempt) = self
            .attempt
            .as_mut()
            .filter(|attempt| attempt.generation == generation)
        else {
            if let Ok(handle) = result {
                debug!(member = %self.member, generation, "Disposing late subscription");
                handle.dispose();
            }
            return;
        };

        attempt.outstanding = attempt.outstanding.saturating_sub(1);

        match result {
            Ok(handle) => {
                let live = LiveSubscription::new(attempt.candidate.uri.clone(), token, handle);
                debug!(
                    member = %self.member,
                    uri = %attempt.candidate.uri,
                    id = %live.id(),
                    token = live.token().name(),
                    "Subscribed"
                );
                attempt.quality.insert(live.id(), DataQuality::NoData);
                attempt
                    .monitors
                    .push(spawn_attempt_monitor(&live, generation, Arc::clone(&self.post)));
                attempt.working.push(live.clone());

                if !self.watchdog.is_running() {
                    let post = Arc::clone(&self.post);
                    self.watchdog.start(self.confirmation_timeout, move |watchdog| {
                        post(ServiceMsg::ConfirmationTimeout { watchdog })
                    });
                }

                delegate.did_subscribe(&live);
            }
            Err(e) => {
                warn!(
                    member = %self.member,
                    uri = %attempt.candidate.uri,
                    token = token.name(),
                    "Subscribe attempt failed: {}",
                    e
                );
                if attempt.failure.is_none() {
                    attempt.failure = Some(SubscriptionFailure::AttemptFailed(e));
                }
            }
        }

        if attempt.outstanding > 0 {
            return;
        }

        match attempt.failure.take() {
            Some(failure) => self.fail_current(failure, delegate),
            None => self.confirm_if_producing(delegate),
        }
    }

    fn on_quality_changed(
        &mut self,
        generation: u64,
        id: Uuid,
        quality: DataQuality,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        let Some(attempt) = self
            .attempt
            .as_mut()
            .filter(|attempt| attempt.generation == generation)
        else {
            return;
        };

        attempt.quality.insert(id, quality);
        self.confirm_if_producing(delegate);
    }

    /// A subscription of the pending candidate ended before confirmation.
    /// The cycle starts over at once; the candidate is not marked failed.
    fn on_stream_ended(
        &mut self,
        generation: u64,
        id: Uuid,
        reason: StreamEndedReason,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        let Some(attempt) = self
            .attempt
            .as_ref()
            .filter(|attempt| attempt.generation == generation)
        else {
            return;
        };
        info!(
            member = %self.member,
            uri = %attempt.candidate.uri,
            %id,
            %reason,
            "Stream ended before confirmation, restarting cycle"
        );
        self.restart(delegate);
    }

    fn on_confirmation_timeout(
        &mut self,
        watchdog: u64,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        if !self.watchdog.take_fired(watchdog) || self.attempt.is_none() {
            return;
        }
        self.fail_current(
            SubscriptionFailure::LivenessTimeout(self.confirmation_timeout),
            delegate,
        );
    }

    fn confirm_if_producing(&mut self, delegate: &mut dyn SubscriptionServiceDelegate) {
        let ready = self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.outstanding == 0 && attempt.is_producing());
        if !ready {
            return;
        }
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        self.watchdog.cancel();
        self.generation += 1;

        let (candidate, subscriptions) = attempt.finish();
        info!(
            member = %self.member,
            uri = %candidate.uri,
            subscriptions = subscriptions.len(),
            "Candidate confirmed producing data"
        );
        delegate.did_receive_data(&candidate, subscriptions);
    }

    fn fail_current(
        &mut self,
        failure: SubscriptionFailure,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        self.watchdog.cancel();
        self.generation += 1;

        let (candidate, subscriptions) = attempt.finish();
        for subscription in &subscriptions {
            subscription.dispose();
        }
        self.fail_candidate(candidate, failure, delegate);
    }

    fn fail_candidate(
        &mut self,
        candidate: StreamCandidate,
        failure: SubscriptionFailure,
        delegate: &mut dyn SubscriptionServiceDelegate,
    ) {
        warn!(member = %self.member, uri = %candidate.uri, "Candidate failed: {}", failure);

        self.failed.insert(candidate.uri.clone());
        self.candidates.retain(|c| c != &candidate);
        delegate.did_fail(&candidate, &failure);
        self.attempt_next(delegate);
    }

    fn abandon_attempt(&mut self) {
        self.watchdog.cancel();
        self.generation += 1;

        if let Some(attempt) = self.attempt.take() {
            debug!(member = %self.member, uri = %attempt.candidate.uri, "Abandoning attempt");
            let (_, subscriptions) = attempt.finish();
            for subscription in &subscriptions {
                subscription.dispose();
            }
        }
    }
}

impl Drop for MemberSubscriptionService {
    fn drop(&mut self) {
        self.abandon_attempt();
    }
}

/// Reports the initial quality, every quality change and the end of the
/// stream for a subscription awaiting confirmation.
fn spawn_attempt_monitor(
    subscription: &LiveSubscription,
    generation: u64,
    post: ServicePoster,
) -> JoinHandle<()> {
    let mut quality = subscription.handle().observe_data_quality();
    let mut ended = subscription.handle().observe_stream_ended();
    let id = subscription.id();

    tokio::spawn(async move {
        let current = *quality.borrow_and_update();
        post(ServiceMsg::QualityChanged {
            generation,
            id,
            quality: current,
        });

        loop {
            let reason = ended.borrow_and_update().clone();
            if let Some(reason) = reason {
                post(ServiceMsg::StreamEnded {
                    generation,
                    id,
                    reason,
                });
                break;
            }

            tokio::select! {
                changed = quality.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *quality.borrow_and_update();
                    post(ServiceMsg::QualityChanged {
                        generation,
                        id,
                        quality: current,
                    });
                }
                changed = ended.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
