//! Per-member connection state machine.
//!
//! [`MemberSubscriptionController`] is a handle to an actor task that owns a
//! [`MemberSubscriptionService`], the confirmed live set and the away
//! watchdog. Every engine callback is forwarded onto the actor's queue, so
//! state is only ever touched from one place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use memberlink_core::{
    BandwidthTarget, ConnectionState, DataQuality, MediaKind, MemberEvent, MemberId,
    StreamCandidate, StreamEndedReason, StreamToken, SubscriptionConfig, Watchdog,
};
use memberlink_engine::{MediaEngine, VideoSink};

use crate::live::LiveSubscription;
use crate::service::{
    MemberSubscriptionService, ServiceMsg, ServicePoster, SubscribeDecision,
    SubscriptionFailure, SubscriptionServiceDelegate,
};

/// How a member's streams should be received.
#[derive(Clone)]
pub struct MemberOptions {
    /// The member is the local participant; nothing is subscribed.
    pub is_self: bool,
    pub receive_audio: bool,
    pub receive_video: bool,
    /// Sink started on video renderers once a live set is confirmed.
    pub video_sink: Option<Arc<dyn VideoSink>>,
}

impl Default for MemberOptions {
    fn default() -> Self {
        Self {
            is_self: false,
            receive_audio: true,
            receive_video: true,
            video_sink: None,
        }
    }
}

impl MemberOptions {
    fn wants(&self, token: &StreamToken) -> bool {
        match token {
            StreamToken::Audio(_) => self.receive_audio,
            StreamToken::Video(_) => self.receive_video,
            StreamToken::Universal(_) => self.receive_audio || self.receive_video,
        }
    }
}

enum Msg {
    SubscribeStreams(Vec<StreamCandidate>),
    SetMediaEnabled { kind: MediaKind, enabled: bool },
    SetBandwidthLimit(Option<u64>),
    AttachTimeShift(Weak<dyn BandwidthTarget>),
    Service(ServiceMsg),
    LiveQuality {
        epoch: u64,
        id: Uuid,
        quality: DataQuality,
    },
    LiveStreamEnded {
        epoch: u64,
        id: Uuid,
        reason: StreamEndedReason,
    },
    AwayTimeout { watchdog: u64 },
    Dispose,
}

/// Handle to a member's subscription actor.
pub struct MemberSubscriptionController {
    member: MemberId,
    tx: mpsc::UnboundedSender<Msg>,
    state: watch::Receiver<ConnectionState>,
    subscriptions: watch::Receiver<Vec<LiveSubscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl MemberSubscriptionController {
    /// Spawn the actor for `member`. Must be called from within a tokio runtime.
    pub fn spawn(
        member: MemberId,
        engine: Arc<dyn MediaEngine>,
        options: MemberOptions,
        config: &SubscriptionConfig,
        events: Sender<MemberEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Pending);
        let (live_tx, subscriptions) = watch::channel(Vec::new());

        let service_tx = tx.clone();
        let post: ServicePoster = Arc::new(move |msg| {
            let _ = service_tx.send(Msg::Service(msg));
        });

        let actor = MemberActor {
            service: MemberSubscriptionService::new(member.clone(), engine, config, post),
            member: MemberState {
                member: member.clone(),
                audio_enabled: true,
                video_enabled: true,
                options,
                bandwidth_limit: None,
                time_shift: None,
                tx: tx.clone(),
                live: Vec::new(),
                live_quality: HashMap::new(),
                live_epoch: 0,
                live_monitors: Vec::new(),
                state: ConnectionState::Pending,
                state_tx,
                live_tx,
                events,
                away: Watchdog::new("away"),
                away_timeout: config.away_timeout(),
            },
        };

        info!(member = %member, "Member subscription controller started");
        let task = tokio::spawn(actor.run(rx));

        Self {
            member,
            tx,
            state,
            subscriptions,
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// Push the member's current stream list. An empty list removes the member.
    pub fn subscribe_streams(&self, streams: Vec<StreamCandidate>) {
        self.send(Msg::SubscribeStreams(streams));
    }

    /// Whether the member currently publishes media of `kind`.
    pub fn set_media_enabled(&self, kind: MediaKind, enabled: bool) {
        self.send(Msg::SetMediaEnabled { kind, enabled });
    }

    pub fn set_bandwidth_limit(&self, bits_per_second: Option<u64>) {
        self.send(Msg::SetBandwidthLimit(bits_per_second));
    }

    /// Forward bandwidth limits to a time shift for as long as it lives.
    pub fn attach_time_shift(&self, target: Weak<dyn BandwidthTarget>) {
        self.send(Msg::AttachTimeShift(target));
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn live_subscriptions(&self) -> Vec<LiveSubscription> {
        self.subscriptions.borrow().clone()
    }

    pub fn watch_live_subscriptions(&self) -> watch::Receiver<Vec<LiveSubscription>> {
        self.subscriptions.clone()
    }

    /// Tear down subscriptions, watchdogs and the actor. Later calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(member = %self.member, "Disposing member subscription controller");
        let _ = self.tx.send(Msg::Dispose);
    }

    /// Dispose and wait for the actor to finish.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(member = %self.member, "Member actor ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, msg: Msg) {
        if self.disposed.load(Ordering::SeqCst) || self.tx.send(msg).is_err() {
            debug!(member = %self.member, "Ignoring request on disposed controller");
        }
    }
}

impl Drop for MemberSubscriptionController {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct MemberActor {
    service: MemberSubscriptionService,
    member: MemberState,
}

impl MemberActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            if !self.handle(msg) {
                break;
            }
        }
        self.member.drop_live();
        self.member.away.cancel();
        self.service.reset();
        info!(member = %self.member.member, "Member subscription controller stopped");
    }

    /// Returns false once the actor should stop.
    fn handle(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::SubscribeStreams(streams) => self.subscribe_streams(streams),
            Msg::SetMediaEnabled { kind, enabled } => {
                match kind {
                    MediaKind::Audio => self.member.audio_enabled = enabled,
                    MediaKind::Video => self.member.video_enabled = enabled,
                }
                debug!(member = %self.member.member, kind = kind.name(), enabled, "Media kind toggled");
                self.member.evaluate_quality();
            }
            Msg::SetBandwidthLimit(limit) => self.member.set_bandwidth_limit(limit),
            Msg::AttachTimeShift(target) => {
                if let (Some(limit), Some(time_shift)) = (self.member.bandwidth_limit, target.upgrade())
                {
                    time_shift.limit_bandwidth(Some(limit));
                }
                self.member.time_shift = Some(target);
            }
            Msg::Service(msg) => self.service.handle(msg, &mut self.member),
            Msg::LiveQuality { epoch, id, quality } => {
                self.member.on_live_quality(epoch, id, quality)
            }
            Msg::LiveStreamEnded { epoch, id, reason } => {
                if self.member.is_live(epoch, id) {
                    info!(member = %self.member.member, %reason, "Live stream ended");
                    self.resubscribe();
                }
            }
            Msg::AwayTimeout { watchdog } => {
                if self.member.away.take_fired(watchdog)
                    && self.member.state == ConnectionState::Away
                {
                    info!(member = %self.member.member, "Member stayed away too long");
                    self.resubscribe();
                }
            }
            Msg::Dispose => return false,
        }
        true
    }

    fn subscribe_streams(&mut self, streams: Vec<StreamCandidate>) {
        if streams.is_empty() {
            self.member.drop_live();
            self.member.away.cancel();
            self.service.reset();
            self.member.set_connection_state(ConnectionState::Removed);
            return;
        }

        if streams.as_slice() != self.service.streams() {
            self.member.drop_live();
            self.member.away.cancel();
            self.member.set_connection_state(ConnectionState::Pending);
        }
        self.service.subscribe_streams(streams, &mut self.member);
    }

    fn resubscribe(&mut self) {
        self.member.drop_live();
        self.member.away.cancel();
        self.member.set_connection_state(ConnectionState::Pending);
        self.service.restart(&mut self.member);
    }
}

struct MemberState {
    member: MemberId,
    options: MemberOptions,
    audio_enabled: bool,
    video_enabled: bool,
    bandwidth_limit: Option<u64>,
    time_shift: Option<Weak<dyn BandwidthTarget>>,
    tx: mpsc::UnboundedSender<Msg>,
    live: Vec<LiveSubscription>,
    live_quality: HashMap<Uuid, DataQuality>,
    live_epoch: u64,
    live_monitors: Vec<JoinHandle<()>>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    live_tx: watch::Sender<Vec<LiveSubscription>>,
    events: Sender<MemberEvent>,
    away: Watchdog,
    away_timeout: Duration,
}

impl MemberState {
    fn set_connection_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        info!(
            member = %self.member,
            previous = previous.name(),
            current = state.name(),
            "Connection state changed"
        );
        self.state_tx.send_replace(state);
        self.emit(MemberEvent::ConnectionStateChanged {
            member: self.member.clone(),
            previous,
            current: state,
        });
    }

    fn emit(&self, event: MemberEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(member = %self.member, "Failed to send member event: {}", e);
        }
    }

    fn is_live(&self, epoch: u64, id: Uuid) -> bool {
        epoch == self.live_epoch && self.live_quality.contains_key(&id)
    }

    fn kind_enabled(&self, subscription: &LiveSubscription) -> bool {
        (self.audio_enabled && subscription.carries(MediaKind::Audio))
            || (self.video_enabled && subscription.carries(MediaKind::Video))
    }

    /// A live subscription of an enabled kind has stopped producing.
    fn has_quality_loss(&self) -> bool {
        self.live.iter().any(|subscription| {
            self.kind_enabled(subscription)
                && !self
                    .live_quality
                    .get(&subscription.id())
                    .is_some_and(|quality| quality.is_producing())
        })
    }

    fn on_live_quality(&mut self, epoch: u64, id: Uuid, quality: DataQuality) {
        if !self.is_live(epoch, id) {
            return;
        }
        debug!(member = %self.member, %id, quality = quality.name(), "Live quality changed");
        self.live_quality.insert(id, quality);
        self.evaluate_quality();
    }

    fn evaluate_quality(&mut self) {
        match self.state {
            ConnectionState::Active if self.has_quality_loss() => {
                self.set_connection_state(ConnectionState::Away);
                let tx = self.tx.clone();
                self.away.start(self.away_timeout, move |watchdog| {
                    let _ = tx.send(Msg::AwayTimeout { watchdog });
                });
            }
            ConnectionState::Away if !self.has_quality_loss() => {
                self.away.cancel();
                self.set_connection_state(ConnectionState::Active);
            }
            _ => {}
        }
    }

    fn set_bandwidth_limit(&mut self, limit: Option<u64>) {
        self.bandwidth_limit = limit;
        debug!(member = %self.member, ?limit, "Bandwidth limit changed");
        for subscription in &self.live {
            for track in subscription.video_tracks() {
                track.limit_bandwidth(limit);
            }
        }
        match self.time_shift.as_ref().map(Weak::upgrade) {
            Some(Some(time_shift)) => time_shift.limit_bandwidth(limit),
            Some(None) => self.time_shift = None,
            None => {}
        }
    }

    fn drop_live(&mut self) {
        self.live_epoch += 1;
        for monitor in self.live_monitors.drain(..) {
            monitor.abort();
        }
        self.live_quality.clear();
        if self.live.is_empty() {
            return;
        }
        for subscription in self.live.drain(..) {
            subscription.dispose();
        }
        self.live_tx.send_replace(Vec::new());
    }
}

impl SubscriptionServiceDelegate for MemberState {
    fn should_subscribe(&mut self, candidate: &StreamCandidate) -> SubscribeDecision {
        if self.options.is_self {
            return SubscribeDecision::Stop;
        }
        if !candidate.tokens.is_empty()
            && !candidate.tokens.iter().any(|token| self.options.wants(token))
        {
            return SubscribeDecision::Skip;
        }
        SubscribeDecision::Subscribe
    }

    fn tokens_for(&mut self, candidate: &StreamCandidate) -> Vec<StreamToken> {
        candidate
            .tokens
            .iter()
            .filter(|token| self.options.wants(token))
            .cloned()
            .collect()
    }

    fn did_subscribe(&mut self, subscription: &LiveSubscription) {
        debug!(member = %self.member, uri = %subscription.stream(), "Starting renderer");
        subscription.renderer().start(None);
    }

    fn did_fail(&mut self, candidate: &StreamCandidate, failure: &SubscriptionFailure) {
        self.emit(MemberEvent::CandidateFailed {
            member: self.member.clone(),
            stream: candidate.uri.clone(),
            reason: failure.to_string(),
        });
    }

    fn did_receive_data(
        &mut self,
        candidate: &StreamCandidate,
        subscriptions: Vec<LiveSubscription>,
    ) {
        self.drop_live();
        let epoch = self.live_epoch;

        for subscription in &subscriptions {
            let mut quality = subscription.handle().observe_data_quality();
            let ended = subscription.handle().observe_stream_ended();
            self.live_quality
                .insert(subscription.id(), *quality.borrow_and_update());
            self.live_monitors.push(spawn_live_monitor(
                subscription.id(),
                epoch,
                quality,
                ended,
                self.tx.clone(),
            ));

            if let Some(sink) = &self.options.video_sink {
                if subscription.carries(MediaKind::Video) {
                    subscription.renderer().start(Some(Arc::clone(sink)));
                }
            }
            if self.bandwidth_limit.is_some() {
                for track in subscription.video_tracks() {
                    track.limit_bandwidth(self.bandwidth_limit);
                }
            }
        }

        let count = subscriptions.len();
        self.live = subscriptions;
        self.live_tx.send_replace(self.live.clone());

        self.set_connection_state(ConnectionState::Active);
        self.emit(MemberEvent::SubscriptionsReceived {
            member: self.member.clone(),
            stream: candidate.uri.clone(),
            count,
        });
        self.evaluate_quality();
    }

    fn did_exhaust_candidates(&mut self) {
        self.emit(MemberEvent::CandidatesExhausted {
            member: self.member.clone(),
        });
    }
}

fn spawn_live_monitor(
    id: Uuid,
    epoch: u64,
    mut quality: watch::Receiver<DataQuality>,
    mut ended: watch::Receiver<Option<StreamEndedReason>>,
    tx: mpsc::UnboundedSender<Msg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reason = ended.borrow_and_update().clone();
            if let Some(reason) = reason {
                let _ = tx.send(Msg::LiveStreamEnded { epoch, id, reason });
                break;
            }

            tokio::select! {
                changed = quality.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let quality = *quality.borrow_and_update();
                    if tx.send(Msg::LiveQuality { epoch, id, quality }).is_err() {
                        break;
                    }
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
