//! Scripted runs against the simulated engine.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use crossbeam_channel::Sender;
use tokio::sync::watch;
use tracing::info;

use memberlink_core::{
    BandwidthTarget, ConnectionState, DataQuality, EngineStatus, MemberEvent, MemberId,
    MemberlinkConfig, PointInTime, SeekOrigin, StreamCandidate, StreamToken, TimeShiftAlias,
    TimeShiftEvent, TimeShiftState,
};
use memberlink_engine::sim::{SimulatedEngine, SimulatedRenderer, SubscribeScript};
use memberlink_engine::{Renderer, VideoFrame, VideoSink};
use memberlink_subscription::{MemberOptions, MemberSubscriptionController};
use memberlink_timeshift::TimeShiftController;

/// Upper bound for any single step to settle.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct LoggingSink;

impl VideoSink for LoggingSink {
    fn on_frame(&self, frame: VideoFrame) {
        tracing::trace!(width = frame.width, height = frame.height, "Frame rendered");
    }
}

fn candidate(uri: &str) -> StreamCandidate {
    StreamCandidate::new(
        uri,
        vec![
            StreamToken::Audio(format!("{uri}#audio")),
            StreamToken::Video(format!("{uri}#video")),
        ],
    )
}

async fn wait_for<T>(
    rx: &mut watch::Receiver<T>,
    what: &str,
    predicate: impl FnMut(&T) -> bool,
) -> anyhow::Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(predicate))
        .await
        .with_context(|| format!("Timed out waiting for {what}"))?
        .with_context(|| format!("Stopped before {what}"))?;
    Ok(())
}

fn spawn_member(
    engine: &SimulatedEngine,
    member: &str,
    config: &MemberlinkConfig,
    events: Sender<MemberEvent>,
) -> MemberSubscriptionController {
    MemberSubscriptionController::spawn(
        MemberId::new(member),
        Arc::new(engine.clone()),
        MemberOptions {
            video_sink: Some(Arc::new(LoggingSink)),
            ..MemberOptions::default()
        },
        &config.subscription,
        events,
    )
}

/// The newest candidate is rejected by the engine; the member goes live on
/// the older one.
pub async fn failover(
    config: &MemberlinkConfig,
    events: Sender<MemberEvent>,
) -> anyhow::Result<()> {
    info!("Scenario: candidate failover");
    let engine = SimulatedEngine::new();
    engine.script("stream-a", SubscribeScript::Fail(EngineStatus::NotFound));

    let member = spawn_member(&engine, "alice", config, events);
    member.subscribe_streams(vec![candidate("stream-b"), candidate("stream-a")]);

    let mut state = member.watch_connection_state();
    wait_for(&mut state, "alice to become active", |s| s.is_active()).await?;

    let live = member.live_subscriptions();
    if live.iter().any(|s| s.stream().as_str() != "stream-b") {
        bail!("alice went live on an unexpected stream: {:?}", live);
    }
    info!(subscriptions = live.len(), attempts = ?engine.attempted_uris(), "Failover complete");

    member.subscribe_streams(Vec::new());
    wait_for(&mut state, "alice to be removed", |s| {
        *s == ConnectionState::Removed
    })
    .await?;

    member.shutdown().await;
    Ok(())
}

/// A live member loses data, is demoted to away and recovers before the
/// away watchdog expires.
pub async fn quality_loss(
    config: &MemberlinkConfig,
    events: Sender<MemberEvent>,
) -> anyhow::Result<()> {
    info!("Scenario: quality loss and recovery");
    let engine = SimulatedEngine::new();
    let member = spawn_member(&engine, "bob", config, events);
    member.subscribe_streams(vec![candidate("stream-c")]);

    let mut state = member.watch_connection_state();
    wait_for(&mut state, "bob to become active", |s| s.is_active()).await?;

    let subscriptions = engine.subscriptions_for("stream-c");
    for subscription in &subscriptions {
        subscription.set_quality(DataQuality::NoData);
    }
    wait_for(&mut state, "bob to go away", |s| *s == ConnectionState::Away).await?;

    for subscription in &subscriptions {
        subscription.set_quality(DataQuality::All);
    }
    wait_for(&mut state, "bob to come back", |s| s.is_active()).await?;

    member.shutdown().await;
    Ok(())
}

/// Replay the last minute of a live member's stream.
pub async fn time_shift(
    config: &MemberlinkConfig,
    member_events: Sender<MemberEvent>,
    time_shift_events: Sender<TimeShiftEvent>,
) -> anyhow::Result<()> {
    info!("Scenario: time shift");
    let engine = SimulatedEngine::new();
    let member = spawn_member(&engine, "carol", config, member_events);
    member.subscribe_streams(vec![candidate("stream-d")]);

    let mut state = member.watch_connection_state();
    wait_for(&mut state, "carol to become active", |s| s.is_active()).await?;

    let video = engine
        .subscriptions_for("stream-d")
        .into_iter()
        .find(|s| matches!(s.token, StreamToken::Video(_)))
        .context("carol has no video subscription")?;
    let renderer: Arc<SimulatedRenderer> = video.simulated_renderer();
    let delivered = renderer.render_frame(VideoFrame {
        data: Bytes::from(vec![0u8; 640 * 360 * 4]),
        width: 640,
        height: 360,
        timestamp: Duration::ZERO,
    });
    if !delivered {
        bail!("carol's video renderer has no sink");
    }

    let controller = TimeShiftController::new(config.time_shift.clone(), time_shift_events);
    let alias = TimeShiftAlias::new("carol-replay");
    let replay = controller.create(
        alias.clone(),
        PointInTime::Seek {
            offset: Duration::from_secs(60),
            origin: SeekOrigin::End,
        },
        Arc::clone(&renderer) as Arc<dyn Renderer>,
    );

    let target = Arc::downgrade(&replay) as Weak<dyn BandwidthTarget>;
    member.attach_time_shift(target);
    member.set_bandwidth_limit(Some(1_500_000));

    let engine_handle = renderer
        .latest_time_shift()
        .context("renderer did not create a time shift")?;
    engine_handle.set_ready(true);

    let mut playback = replay.watch_state();
    wait_for(&mut playback, "replay to be ready", |s| {
        *s == TimeShiftState::Ready
    })
    .await?;

    controller.play(&alias)?;
    wait_for(&mut playback, "replay to play", |s| *s == TimeShiftState::Playing).await?;
    engine_handle.set_playback_head(Duration::from_secs(12));

    controller.pause(&alias)?;
    wait_for(&mut playback, "replay to pause", |s| *s == TimeShiftState::Paused).await?;

    controller.seek(&alias, Duration::from_secs(30), SeekOrigin::Beginning)?;
    wait_for(&mut playback, "seek to land", |s| {
        *s == TimeShiftState::SeekingSucceeded
    })
    .await?;

    info!(
        head = ?replay.playback_head(),
        bandwidth = ?engine_handle.bandwidth_limit(),
        calls = ?engine_handle.calls(),
        "Time shift complete"
    );

    controller.dispose_all();
    replay.shutdown().await;
    member.shutdown().await;
    Ok(())
}
