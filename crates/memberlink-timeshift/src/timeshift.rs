//! Playback state machine for a single time shift.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use memberlink_core::{
    BandwidthTarget, EngineStatus, PointInTime, SeekOrigin, TimeShiftAlias, TimeShiftConfig,
    TimeShiftError, TimeShiftEvent, TimeShiftState, Watchdog,
};
use memberlink_engine::{Renderer, StatusResponse, TimeShiftHandle};

/// Number of automatic retries allowed for a time shift starting at `point`.
///
/// A relative point can always be re-seeked, so it gets a fixed budget. An
/// absolute point gets one retry per retry delay that has elapsed since the
/// timestamp.
pub fn max_retries(point: &PointInTime, config: &TimeShiftConfig, now: SystemTime) -> u32 {
    match point {
        PointInTime::Seek { .. } => config.relative_max_retries,
        PointInTime::Timestamp(timestamp) => {
            let elapsed = now.duration_since(*timestamp).unwrap_or_default();
            let delay = config.retry_delay().as_millis().max(1);
            u32::try_from(elapsed.as_millis() / delay).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Play,
    Loop(Duration),
    Pause,
    Stop,
    Seek,
}

impl Transport {
    fn name(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Loop(_) => "loop",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Seek => "seek",
        }
    }
}

enum Msg {
    Play,
    PlayLoop(Duration),
    Pause,
    Stop,
    Seek { offset: Duration, origin: SeekOrigin },
    LimitBandwidth(Option<u64>),
    Ready { epoch: u64, ready: bool },
    Head { epoch: u64, position: Duration },
    Failure { epoch: u64, status: EngineStatus },
    Ended { epoch: u64 },
    TransportDone {
        epoch: u64,
        transport: Transport,
        status: EngineStatus,
    },
    RetryTimeout { watchdog: u64 },
    Dispose,
}

/// Handle to a time shift's playback actor.
///
/// Commands are fire-and-observe: outcomes show up on the state stream and,
/// for rejections and transport failures, as [`TimeShiftEvent::Error`].
pub struct TimeShift {
    alias: TimeShiftAlias,
    point: PointInTime,
    max_retries: u32,
    tx: mpsc::UnboundedSender<Msg>,
    state: watch::Receiver<TimeShiftState>,
    head: watch::Receiver<Duration>,
    head_tx: Arc<watch::Sender<Duration>>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

impl TimeShift {
    /// Seek `renderer` to `point` and start tracking playback.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(name = "time_shift_create", skip_all, fields(alias = %alias))]
    pub fn spawn(
        alias: TimeShiftAlias,
        point: PointInTime,
        renderer: Arc<dyn Renderer>,
        config: &TimeShiftConfig,
        events: Sender<TimeShiftEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TimeShiftState::Idle);
        let (head_tx, head) = watch::channel(Duration::ZERO);
        let head_tx = Arc::new(head_tx);
        let disposed = Arc::new(AtomicBool::new(false));
        let max_retries = max_retries(&point, config, SystemTime::now());

        let mut actor = TimeShiftActor {
            alias: alias.clone(),
            point,
            renderer,
            retry_delay: config.retry_delay(),
            head_interval: config.playback_head_interval(),
            max_retries,
            retries: 0,
            state: TimeShiftState::Idle,
            state_tx,
            head_tx: Arc::clone(&head_tx),
            disposed: Arc::clone(&disposed),
            events,
            tx: tx.clone(),
            handle: None,
            epoch: 0,
            observers: Vec::new(),
            retry: Watchdog::new("time_shift_retry"),
            bandwidth: None,
        };

        info!(alias = %alias, ?point, max_retries, "Creating time shift");
        actor.setup();
        let task = tokio::spawn(actor.run(rx));

        Self {
            alias,
            point,
            max_retries,
            tx,
            state,
            head,
            head_tx,
            task: Mutex::new(Some(task)),
            disposed,
        }
    }

    pub fn alias(&self) -> &TimeShiftAlias {
        &self.alias
    }

    pub fn point(&self) -> &PointInTime {
        &self.point
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn state(&self) -> TimeShiftState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TimeShiftState> {
        self.state.clone()
    }

    pub fn playback_head(&self) -> Duration {
        *self.head.borrow()
    }

    pub fn watch_playback_head(&self) -> watch::Receiver<Duration> {
        self.head.clone()
    }

    pub fn play(&self) {
        self.send(Msg::Play);
    }

    /// Play the next `duration` of the shifted stream in a loop.
    pub fn play_loop(&self, duration: Duration) {
        self.send(Msg::PlayLoop(duration));
    }

    pub fn pause(&self) {
        self.send(Msg::Pause);
    }

    pub fn stop(&self) {
        self.send(Msg::Stop);
    }

    pub fn seek(&self, offset: Duration, origin: SeekOrigin) {
        self.send(Msg::Seek { offset, origin });
    }

    /// Reset the playback head and stop reacting to the engine. Pending
    /// retries are cancelled and the engine handle released by the actor.
    /// Later calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(alias = %self.alias, "Disposing time shift");
        self.head_tx.send_replace(Duration::ZERO);
        let _ = self.tx.send(Msg::Dispose);
    }

    /// Dispose and wait for the actor to finish.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(alias = %self.alias, "Time shift actor ended abnormally: {}", e);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn send(&self, msg: Msg) {
        if self.is_disposed() || self.tx.send(msg).is_err() {
            debug!(alias = %self.alias, "Ignoring command on disposed time shift");
        }
    }
}

impl BandwidthTarget for TimeShift {
    fn limit_bandwidth(&self, bits_per_second: Option<u64>) {
        self.send(Msg::LimitBandwidth(bits_per_second));
    }
}

impl Drop for TimeShift {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct TimeShiftActor {
    alias: TimeShiftAlias,
    point: PointInTime,
    renderer: Arc<dyn Renderer>,
    retry_delay: Duration,
    head_interval: Duration,
    max_retries: u32,
    retries: u32,
    state: TimeShiftState,
    state_tx: watch::Sender<TimeShiftState>,
    head_tx: Arc<watch::Sender<Duration>>,
    /// Set by the handle; once true no queued message is processed.
    disposed: Arc<AtomicBool>,
    events: Sender<TimeShiftEvent>,
    tx: mpsc::UnboundedSender<Msg>,
    handle: Option<Arc<dyn TimeShiftHandle>>,
    /// Bumped whenever the engine handle is replaced or released.
    epoch: u64,
    observers: Vec<JoinHandle<()>>,
    retry: Watchdog,
    bandwidth: Option<u64>,
}

impl TimeShiftActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            if self.disposed.load(Ordering::SeqCst) || !self.process(msg) {
                break;
            }
        }
        self.retry.cancel();
        self.release_handle();
        self.head_tx.send_replace(Duration::ZERO);
        info!(alias = %self.alias, "Time shift disposed");
    }

    /// Returns false once the actor should stop.
    fn process(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Play => self.start_playing(Transport::Play),
            Msg::PlayLoop(duration) => self.start_playing(Transport::Loop(duration)),
            Msg::Pause => self.pause(),
            Msg::Stop => self.stop(),
            Msg::Seek { offset, origin } => self.seek(offset, origin),
            Msg::LimitBandwidth(limit) => {
                self.bandwidth = limit;
                if let Some(handle) = &self.handle {
                    handle.limit_bandwidth(limit);
                }
            }
            Msg::Ready { epoch, ready } if epoch == self.epoch => self.on_ready(ready),
            Msg::Head { epoch, position } if epoch == self.epoch => self.on_head(position),
            Msg::Failure { epoch, status } if epoch == self.epoch => self.on_failure(status),
            Msg::Ended { epoch } if epoch == self.epoch => {
                if !self.state.is_failed() {
                    self.set_state(TimeShiftState::Ended);
                }
            }
            Msg::TransportDone {
                epoch,
                transport,
                status,
            } if epoch == self.epoch => self.on_transport_done(transport, status),
            Msg::RetryTimeout { watchdog } => {
                if self.retry.take_fired(watchdog) {
                    info!(alias = %self.alias, attempt = self.retries, "Retrying time shift");
                    self.setup();
                }
            }
            Msg::Dispose => return false,
            _ => debug!(alias = %self.alias, "Dropping message for released handle"),
        }
        true
    }

    /// Seek the renderer and attach to the resulting handle.
    fn setup(&mut self) {
        if !self.renderer.is_seekable() {
            self.fail(TimeShiftError::NotSeekable);
            return;
        }
        let Some(handle) = self.renderer.seek(&self.point) else {
            self.fail(TimeShiftError::CreationFailed);
            return;
        };

        self.epoch += 1;
        if self.bandwidth.is_some() {
            handle.limit_bandwidth(self.bandwidth);
        }
        self.observe(&handle);
        self.handle = Some(handle);
        self.set_state(TimeShiftState::Starting);
    }

    fn observe(&mut self, handle: &Arc<dyn TimeShiftHandle>) {
        let epoch = self.epoch;

        let mut ready = handle.observe_ready_for_playback();
        let tx = self.tx.clone();
        self.observers.push(tokio::spawn(async move {
            loop {
                let value = *ready.borrow_and_update();
                if tx.send(Msg::Ready { epoch, ready: value }).is_err() {
                    break;
                }
                if ready.changed().await.is_err() {
                    break;
                }
            }
        }));

        let mut head = handle.observe_playback_head();
        let interval = self.head_interval;
        let tx = self.tx.clone();
        self.observers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = None;
            loop {
                ticker.tick().await;
                if head.has_changed().is_err() {
                    break;
                }
                let position = *head.borrow_and_update();
                if last == Some(position) {
                    continue;
                }
                last = Some(position);
                if tx.send(Msg::Head { epoch, position }).is_err() {
                    break;
                }
            }
        }));

        let mut failures = handle.observe_failure();
        let tx = self.tx.clone();
        self.observers.push(tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(status) if status.is_ok() => {}
                    Ok(status) => {
                        if tx.send(Msg::Failure { epoch, status }).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut ended = handle.observe_ended();
        let tx = self.tx.clone();
        self.observers.push(tokio::spawn(async move {
            let mut was_ended = false;
            loop {
                let is_ended = *ended.borrow_and_update();
                if is_ended && !was_ended && tx.send(Msg::Ended { epoch }).is_err() {
                    break;
                }
                was_ended = is_ended;
                if ended.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Detach from and dispose the current engine handle.
    fn release_handle(&mut self) {
        self.epoch += 1;
        for observer in self.observers.drain(..) {
            observer.abort();
        }
        if let Some(handle) = self.handle.take() {
            handle.dispose();
        }
    }

    fn on_ready(&mut self, ready: bool) {
        if self.state.ignores_readiness() {
            return;
        }
        let next = if ready {
            TimeShiftState::Ready
        } else {
            TimeShiftState::Starting
        };
        self.set_state(next);
    }

    fn on_head(&mut self, position: Duration) {
        let disposed = &self.disposed;
        let changed = self.head_tx.send_if_modified(|head| {
            if *head == position || disposed.load(Ordering::SeqCst) {
                false
            } else {
                *head = position;
                true
            }
        });
        if changed {
            self.emit(TimeShiftEvent::PlaybackHead {
                alias: self.alias.clone(),
                position,
            });
        }
    }

    fn on_failure(&mut self, status: EngineStatus) {
        if self.state.is_failed() {
            return;
        }
        self.retries += 1;
        warn!(
            alias = %self.alias,
            %status,
            retries = self.retries,
            max_retries = self.max_retries,
            "Time shift failed"
        );

        self.release_handle();
        if self.retries > self.max_retries {
            self.fail(TimeShiftError::RetriesExhausted(self.max_retries));
            return;
        }

        self.set_state(TimeShiftState::Starting);
        let tx = self.tx.clone();
        self.retry.start(self.retry_delay, move |watchdog| {
            let _ = tx.send(Msg::RetryTimeout { watchdog });
        });
    }

    fn start_playing(&mut self, transport: Transport) {
        if !self.state.can_play() {
            self.reject(TimeShiftError::PlayingNotAllowed(self.state));
            return;
        }
        let Some(handle) = &self.handle else {
            self.reject(TimeShiftError::PlayingNotAllowed(self.state));
            return;
        };
        let response = match transport {
            Transport::Loop(duration) => handle.play_loop(duration),
            _ => handle.play(),
        };
        self.await_transport(transport, response);
    }

    fn pause(&mut self) {
        if !self.state.can_pause() {
            self.reject(TimeShiftError::PausingNotAllowed(self.state));
            return;
        }
        if let Some(handle) = &self.handle {
            let response = handle.pause();
            self.await_transport(Transport::Pause, response);
        }
    }

    fn stop(&mut self) {
        if !self.state.can_stop() {
            self.reject(TimeShiftError::StoppingNotAllowed(self.state));
            return;
        }
        if let Some(handle) = &self.handle {
            let response = handle.stop();
            self.await_transport(Transport::Stop, response);
        }
    }

    fn seek(&mut self, offset: Duration, origin: SeekOrigin) {
        if !self.state.can_seek() {
            self.reject(TimeShiftError::SeekingNotAllowed(self.state));
            return;
        }
        let Some(handle) = self.handle.clone() else {
            self.reject(TimeShiftError::SeekingNotAllowed(self.state));
            return;
        };

        debug!(alias = %self.alias, ?offset, ?origin, "Seeking");
        drop(handle.pause());
        self.set_state(TimeShiftState::Seeking);
        self.await_transport(Transport::Seek, handle.seek(offset, origin));
    }

    fn await_transport(&self, transport: Transport, response: StatusResponse) {
        let epoch = self.epoch;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let status = response.await.unwrap_or(EngineStatus::Failed);
            let _ = tx.send(Msg::TransportDone {
                epoch,
                transport,
                status,
            });
        });
    }

    fn on_transport_done(&mut self, transport: Transport, status: EngineStatus) {
        if self.state.is_failed() {
            return;
        }
        if !status.is_ok() {
            let error = TimeShiftError::Transport {
                operation: transport.name().to_string(),
                status,
            };
            if transport == Transport::Seek {
                self.fail(error);
            } else {
                self.reject(error);
            }
            return;
        }

        match transport {
            Transport::Play | Transport::Loop(_) => self.set_state(TimeShiftState::Playing),
            Transport::Pause => self.set_state(TimeShiftState::Paused),
            Transport::Stop => self.set_state(TimeShiftState::Ready),
            Transport::Seek => {
                if self.state == TimeShiftState::Seeking {
                    self.set_state(TimeShiftState::SeekingSucceeded);
                }
            }
        }
    }

    fn fail(&mut self, error: TimeShiftError) {
        self.retry.cancel();
        self.release_handle();
        self.set_state(TimeShiftState::Failed);
        self.emit_error(error);
    }

    fn reject(&self, error: TimeShiftError) {
        warn!(alias = %self.alias, "{}", error);
        self.emit_error(error);
    }

    fn emit_error(&self, error: TimeShiftError) {
        self.emit(TimeShiftEvent::Error {
            alias: self.alias.clone(),
            error,
        });
    }

    fn set_state(&mut self, state: TimeShiftState) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        info!(
            alias = %self.alias,
            previous = previous.name(),
            current = state.name(),
            "Time shift state changed"
        );
        self.state_tx.send_replace(state);
        self.emit(TimeShiftEvent::StateChanged {
            alias: self.alias.clone(),
            previous,
            current: state,
        });
    }

    fn emit(&self, event: TimeShiftEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(alias = %self.alias, "Failed to send time shift event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Receiver;

    use memberlink_core::time_shift_event_channel;
    use memberlink_engine::sim::{SimulatedRenderer, SimulatedTimeShift, TransportCall};

    use super::*;

    struct Harness {
        renderer: Arc<SimulatedRenderer>,
        time_shift: TimeShift,
        events: Receiver<TimeShiftEvent>,
    }

    impl Harness {
        fn new(point: PointInTime) -> Self {
            Self::with_renderer(point, Arc::new(SimulatedRenderer::new(true)))
        }

        fn with_renderer(point: PointInTime, renderer: Arc<SimulatedRenderer>) -> Self {
            let (tx, events) = time_shift_event_channel();
            let time_shift = TimeShift::spawn(
                TimeShiftAlias::new("replay"),
                point,
                Arc::clone(&renderer) as Arc<dyn Renderer>,
                &TimeShiftConfig::default(),
                tx,
            );
            Self {
                renderer,
                time_shift,
                events,
            }
        }

        fn engine_handle(&self) -> Arc<SimulatedTimeShift> {
            self.renderer.latest_time_shift().unwrap()
        }

        fn errors(&self) -> Vec<TimeShiftError> {
            self.events
                .try_iter()
                .filter_map(|event| match event {
                    TimeShiftEvent::Error { error, .. } => Some(error),
                    _ => None,
                })
                .collect()
        }

        fn heads(&self) -> Vec<Duration> {
            self.events
                .try_iter()
                .filter_map(|event| match event {
                    TimeShiftEvent::PlaybackHead { position, .. } => Some(position),
                    _ => None,
                })
                .collect()
        }

        async fn ready(&self) {
            self.engine_handle().set_ready(true);
            settle().await;
            assert_eq!(self.time_shift.state(), TimeShiftState::Ready);
        }

        async fn playing(&self) {
            self.ready().await;
            self.time_shift.play();
            settle().await;
            assert_eq!(self.time_shift.state(), TimeShiftState::Playing);
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn last_minute() -> PointInTime {
        PointInTime::Seek {
            offset: Duration::from_secs(60),
            origin: SeekOrigin::End,
        }
    }

    #[test]
    fn retry_budget_follows_point_in_time() {
        let config = TimeShiftConfig::default();
        let now = SystemTime::now();

        assert_eq!(max_retries(&last_minute(), &config, now), 3);

        let hundred_seconds_ago = PointInTime::Timestamp(now - Duration::from_secs(100));
        assert_eq!(max_retries(&hundred_seconds_ago, &config, now), 10);

        let future = PointInTime::Timestamp(now + Duration::from_secs(30));
        assert_eq!(max_retries(&future, &config, now), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_enters_starting_then_ready() {
        let h = Harness::new(last_minute());
        assert_eq!(h.time_shift.state(), TimeShiftState::Starting);
        assert_eq!(h.renderer.seek_count(), 1);
        assert_eq!(h.engine_handle().point, last_minute());

        h.ready().await;
        h.engine_handle().set_ready(false);
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn unseekable_renderer_fails_creation() {
        let renderer = Arc::new(SimulatedRenderer::new(false));
        let h = Harness::with_renderer(last_minute(), renderer);
        settle().await;

        assert_eq!(h.time_shift.state(), TimeShiftState::Failed);
        assert_eq!(h.renderer.seek_count(), 0);
        assert_eq!(h.errors(), vec![TimeShiftError::NotSeekable]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_engine_handle_fails_creation() {
        let renderer = Arc::new(SimulatedRenderer::new(true));
        renderer.set_provides_time_shift(false);
        let h = Harness::with_renderer(last_minute(), renderer);

        assert_eq!(h.time_shift.state(), TimeShiftState::Failed);
        assert_eq!(h.errors(), vec![TimeShiftError::CreationFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_while_paused_is_rejected() {
        let h = Harness::new(last_minute());
        h.playing().await;
        h.time_shift.pause();
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Paused);
        h.events.try_iter().count();

        h.time_shift.pause();
        settle().await;

        assert_eq!(h.time_shift.state(), TimeShiftState::Paused);
        assert_eq!(
            h.errors(),
            vec![TimeShiftError::PausingNotAllowed(TimeShiftState::Paused)]
        );
        assert_eq!(
            h.engine_handle().calls(),
            vec![TransportCall::Play, TransportCall::Pause]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commands_before_ready_are_rejected() {
        let h = Harness::new(last_minute());
        h.time_shift.play();
        h.time_shift.stop();
        h.time_shift.seek(Duration::from_secs(5), SeekOrigin::Current);
        settle().await;

        assert_eq!(
            h.errors(),
            vec![
                TimeShiftError::PlayingNotAllowed(TimeShiftState::Starting),
                TimeShiftError::StoppingNotAllowed(TimeShiftState::Starting),
                TimeShiftError::SeekingNotAllowed(TimeShiftState::Starting),
            ]
        );
        assert!(h.engine_handle().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn seek_pauses_and_lands_in_seeking_succeeded() {
        let h = Harness::new(last_minute());
        h.playing().await;

        h.time_shift.seek(Duration::from_secs(5), SeekOrigin::Current);
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::SeekingSucceeded);
        assert_eq!(
            h.engine_handle().calls(),
            vec![
                TransportCall::Play,
                TransportCall::Pause,
                TransportCall::Seek {
                    offset: Duration::from_secs(5),
                    origin: SeekOrigin::Current,
                },
            ]
        );

        h.time_shift.play_loop(Duration::from_secs(20));
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Playing);
        assert_eq!(
            h.engine_handle().calls().last(),
            Some(&TransportCall::Loop(Duration::from_secs(20)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seek_is_terminal() {
        let h = Harness::new(last_minute());
        h.playing().await;

        h.engine_handle().set_transport_status(EngineStatus::Failed);
        h.time_shift.seek(Duration::from_secs(5), SeekOrigin::Beginning);
        settle().await;

        assert_eq!(h.time_shift.state(), TimeShiftState::Failed);
        assert_eq!(h.engine_handle().dispose_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_leaves_state_unchanged() {
        let h = Harness::new(last_minute());
        h.ready().await;
        h.engine_handle().set_transport_status(EngineStatus::Conflict);

        h.time_shift.play();
        settle().await;

        assert_eq!(h.time_shift.state(), TimeShiftState::Ready);
        assert_eq!(
            h.errors(),
            vec![TimeShiftError::Transport {
                operation: "play".to_string(),
                status: EngineStatus::Conflict,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_to_ready() {
        let h = Harness::new(last_minute());
        h.playing().await;
        h.time_shift.stop();
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_is_ignored_while_playing() {
        let h = Harness::new(last_minute());
        h.playing().await;
        h.engine_handle().set_ready(false);
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_ends_and_allows_replay() {
        let h = Harness::new(last_minute());
        h.playing().await;
        h.time_shift.pause();
        settle().await;

        h.engine_handle().set_ended(true);
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Ended);

        h.time_shift.play();
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn every_replay_can_end_again() {
        let h = Harness::new(last_minute());
        h.playing().await;
        let handle = h.engine_handle();

        for _ in 0..2 {
            handle.set_ended(true);
            settle().await;
            assert_eq!(h.time_shift.state(), TimeShiftState::Ended);

            handle.set_ended(false);
            h.time_shift.play();
            settle().await;
            assert_eq!(h.time_shift.state(), TimeShiftState::Playing);
        }

        handle.set_ended(true);
        settle().await;
        assert_eq!(h.time_shift.state(), TimeShiftState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_head_is_throttled_and_deduplicated() {
        let h = Harness::new(last_minute());
        settle().await;
        let handle = h.engine_handle();

        handle.set_playback_head(Duration::from_secs(1));
        handle.set_playback_head(Duration::from_secs(2));
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(h.heads(), vec![Duration::from_secs(2)]);

        handle.set_playback_head(Duration::from_secs(2));
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert!(h.heads().is_empty());

        handle.set_playback_head(Duration::from_secs(3));
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert!(h.heads().is_empty());
        tokio::time::advance(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(h.heads(), vec![Duration::from_secs(3)]);
        assert_eq!(h.time_shift.playback_head(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_until_budget_is_spent() {
        let point = PointInTime::Timestamp(SystemTime::now() - Duration::from_secs(100));
        let h = Harness::new(point);
        assert_eq!(h.time_shift.max_retries(), 10);

        for attempt in 1..=11 {
            h.engine_handle().fail(EngineStatus::Timeout);
            settle().await;
            if attempt <= 10 {
                assert_eq!(h.time_shift.state(), TimeShiftState::Starting);
                tokio::time::advance(Duration::from_secs(10)).await;
                settle().await;
                assert_eq!(h.renderer.seek_count(), attempt + 1);
            }
        }

        assert_eq!(h.time_shift.state(), TimeShiftState::Failed);
        assert!(h
            .errors()
            .contains(&TimeShiftError::RetriesExhausted(10)));

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(h.renderer.seek_count(), 11);
        assert!(h
            .renderer
            .time_shifts()
            .iter()
            .all(|handle| handle.dispose_count() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_plays_do_not_refill_retry_budget() {
        let point = PointInTime::Timestamp(SystemTime::now() - Duration::from_secs(20));
        let h = Harness::new(point);
        assert_eq!(h.time_shift.max_retries(), 2);

        for attempt in 1..=3 {
            h.playing().await;
            h.engine_handle().fail(EngineStatus::Timeout);
            settle().await;
            if attempt < 3 {
                assert_eq!(h.time_shift.state(), TimeShiftState::Starting);
                tokio::time::advance(Duration::from_secs(10)).await;
                settle().await;
            }
        }

        assert_eq!(h.time_shift.state(), TimeShiftState::Failed);
        assert_eq!(h.renderer.seek_count(), 3);
        assert!(h.errors().contains(&TimeShiftError::RetriesExhausted(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reapplies_bandwidth_limit() {
        let h = Harness::new(last_minute());
        h.time_shift.limit_bandwidth(Some(250_000));
        settle().await;
        assert_eq!(h.engine_handle().bandwidth_limit(), Some(250_000));

        h.engine_handle().fail(EngineStatus::Failed);
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(h.renderer.seek_count(), 2);
        assert_eq!(h.engine_handle().bandwidth_limit(), Some(250_000));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_resets_head() {
        let h = Harness::new(last_minute());
        settle().await;
        h.engine_handle().set_playback_head(Duration::from_secs(7));
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(h.time_shift.playback_head(), Duration::from_secs(7));

        h.time_shift.dispose();
        assert_eq!(h.time_shift.playback_head(), Duration::ZERO);
        h.engine_handle().set_playback_head(Duration::from_secs(9));
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(h.time_shift.playback_head(), Duration::ZERO);

        h.time_shift.dispose();
        h.time_shift.shutdown().await;

        assert_eq!(h.engine_handle().dispose_count(), 1);
        assert_eq!(h.time_shift.playback_head(), Duration::ZERO);

        h.time_shift.play();
        settle().await;
        assert!(h.errors().is_empty());
    }
}
