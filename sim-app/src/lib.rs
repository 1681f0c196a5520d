//! Memberlink simulator library.

mod scenarios;

use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memberlink_core::{member_event_channel, time_shift_event_channel, MemberlinkConfig};

/// Initialize logging.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "memberlink_sim=debug,memberlink_subscription=debug,memberlink_timeshift=debug,memberlink_engine=info,memberlink_core=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run every scenario against the simulated engine.
pub async fn run(config: MemberlinkConfig) -> anyhow::Result<()> {
    let (member_tx, member_rx) = member_event_channel();
    let (time_shift_tx, time_shift_rx) = time_shift_event_channel();
    let member_log = spawn_event_logger("member", member_rx);
    let time_shift_log = spawn_event_logger("time_shift", time_shift_rx);

    let outcome = async {
        scenarios::failover(&config, member_tx.clone()).await?;
        scenarios::quality_loss(&config, member_tx.clone()).await?;
        scenarios::time_shift(&config, member_tx.clone(), time_shift_tx.clone()).await
    }
    .await;

    drop(member_tx);
    drop(time_shift_tx);
    let member_events = join_logger(member_log).await;
    let time_shift_events = join_logger(time_shift_log).await;
    info!(member_events, time_shift_events, "Simulation finished");

    outcome
}

/// Log every event of a channel as JSON until all senders are gone.
fn spawn_event_logger<T>(channel: &'static str, rx: Receiver<T>) -> JoinHandle<usize>
where
    T: Serialize + Send + 'static,
{
    thread::spawn(move || {
        let mut count = 0;
        for event in rx.iter() {
            count += 1;
            match serde_json::to_string(&event) {
                Ok(json) => info!(channel, "{}", json),
                Err(e) => warn!(channel, "Failed to serialize event: {}", e),
            }
        }
        count
    })
}

async fn join_logger(handle: JoinHandle<usize>) -> usize {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(count)) => count,
        _ => {
            warn!("Event logger thread panicked");
            0
        }
    }
}
