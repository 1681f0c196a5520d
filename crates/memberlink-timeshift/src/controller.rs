//! Registry of time shifts keyed by alias.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use memberlink_core::{
    BandwidthTarget, PointInTime, SeekOrigin, TimeShiftAlias, TimeShiftConfig, TimeShiftError,
    TimeShiftEvent,
};
use memberlink_engine::Renderer;

use crate::timeshift::TimeShift;

/// Creates, looks up and disposes time shifts by alias.
///
/// At most one time shift exists per alias; creating a new one disposes the
/// previous instance.
pub struct TimeShiftController {
    config: TimeShiftConfig,
    events: Sender<TimeShiftEvent>,
    time_shifts: Mutex<HashMap<TimeShiftAlias, Arc<TimeShift>>>,
}

impl TimeShiftController {
    pub fn new(config: TimeShiftConfig, events: Sender<TimeShiftEvent>) -> Self {
        Self {
            config,
            events,
            time_shifts: Mutex::new(HashMap::new()),
        }
    }

    /// Create a time shift on `renderer` at `point`, replacing any existing
    /// one for `alias`. Must be called from within a tokio runtime.
    pub fn create(
        &self,
        alias: TimeShiftAlias,
        point: PointInTime,
        renderer: Arc<dyn Renderer>,
    ) -> Arc<TimeShift> {
        let time_shift = Arc::new(TimeShift::spawn(
            alias.clone(),
            point,
            renderer,
            &self.config,
            self.events.clone(),
        ));

        let previous = self
            .time_shifts
            .lock()
            .insert(alias.clone(), Arc::clone(&time_shift));
        if let Some(previous) = previous {
            info!(alias = %alias, "Replacing existing time shift");
            previous.dispose();
        }

        time_shift
    }

    pub fn get(&self, alias: &TimeShiftAlias) -> Option<Arc<TimeShift>> {
        self.time_shifts.lock().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<TimeShiftAlias> {
        self.time_shifts.lock().keys().cloned().collect()
    }

    pub fn play(&self, alias: &TimeShiftAlias) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.play();
        Ok(())
    }

    pub fn play_loop(&self, alias: &TimeShiftAlias, duration: Duration) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.play_loop(duration);
        Ok(())
    }

    pub fn pause(&self, alias: &TimeShiftAlias) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.pause();
        Ok(())
    }

    pub fn stop(&self, alias: &TimeShiftAlias) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.stop();
        Ok(())
    }

    pub fn seek(
        &self,
        alias: &TimeShiftAlias,
        offset: Duration,
        origin: SeekOrigin,
    ) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.seek(offset, origin);
        Ok(())
    }

    pub fn limit_bandwidth(
        &self,
        alias: &TimeShiftAlias,
        bits_per_second: Option<u64>,
    ) -> Result<(), TimeShiftError> {
        self.lookup(alias)?.limit_bandwidth(bits_per_second);
        Ok(())
    }

    /// Dispose and forget the time shift for `alias`. Returns false if none existed.
    pub fn remove(&self, alias: &TimeShiftAlias) -> bool {
        let removed = self.time_shifts.lock().remove(alias);
        match removed {
            Some(time_shift) => {
                debug!(alias = %alias, "Removing time shift");
                time_shift.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every registered time shift.
    pub fn dispose_all(&self) {
        let time_shifts: Vec<Arc<TimeShift>> =
            self.time_shifts.lock().drain().map(|(_, ts)| ts).collect();
        if !time_shifts.is_empty() {
            info!(count = time_shifts.len(), "Disposing all time shifts");
        }
        for time_shift in time_shifts {
            time_shift.dispose();
        }
    }

    fn lookup(&self, alias: &TimeShiftAlias) -> Result<Arc<TimeShift>, TimeShiftError> {
        self.get(alias).ok_or_else(|| {
            warn!(alias = %alias, "No time shift for alias");
            TimeShiftError::NotFound(alias.to_string())
        })
    }
}

impl Drop for TimeShiftController {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Receiver;

    use memberlink_core::{time_shift_event_channel, TimeShiftState};
    use memberlink_engine::sim::{SimulatedRenderer, TransportCall};

    use super::*;

    fn controller() -> (TimeShiftController, Receiver<TimeShiftEvent>) {
        let (tx, rx) = time_shift_event_channel();
        (TimeShiftController::new(TimeShiftConfig::default(), tx), rx)
    }

    fn point() -> PointInTime {
        PointInTime::Seek {
            offset: Duration::from_secs(30),
            origin: SeekOrigin::End,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_replaces_existing_alias() {
        let (controller, _events) = controller();
        let renderer = Arc::new(SimulatedRenderer::new(true));
        let alias = TimeShiftAlias::new("clip");

        let first = controller.create(alias.clone(), point(), renderer.clone());
        let second = controller.create(alias.clone(), point(), renderer.clone());
        first.shutdown().await;

        assert!(first.is_disposed());
        assert!(!second.is_disposed());
        assert_eq!(renderer.time_shifts()[0].dispose_count(), 1);
        assert_eq!(renderer.time_shifts()[1].dispose_count(), 0);
        assert!(Arc::ptr_eq(&controller.get(&alias).unwrap(), &second));
        assert_eq!(controller.aliases(), vec![alias]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_alias_is_reported() {
        let (controller, _events) = controller();
        let alias = TimeShiftAlias::new("missing");

        assert_eq!(
            controller.play(&alias),
            Err(TimeShiftError::NotFound("missing".to_string()))
        );
        assert!(controller.pause(&alias).is_err());
        assert!(controller
            .seek(&alias, Duration::from_secs(1), SeekOrigin::Current)
            .is_err());
        assert!(!controller.remove(&alias));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_aliased_time_shift() {
        let (controller, events) = controller();
        let renderer = Arc::new(SimulatedRenderer::new(true));
        let alias = TimeShiftAlias::new("clip");
        let time_shift = controller.create(alias.clone(), point(), renderer.clone());

        renderer.latest_time_shift().unwrap().set_ready(true);
        settle().await;
        controller.play(&alias).unwrap();
        settle().await;
        controller.pause(&alias).unwrap();
        settle().await;

        assert_eq!(time_shift.state(), TimeShiftState::Paused);
        assert_eq!(
            renderer.latest_time_shift().unwrap().calls(),
            vec![TransportCall::Play, TransportCall::Pause]
        );
        assert!(events
            .try_iter()
            .all(|event| event.alias() == &alias));
    }

    #[tokio::test(start_paused = true)]
    async fn weak_bandwidth_target_follows_registry() {
        let (controller, _events) = controller();
        let renderer = Arc::new(SimulatedRenderer::new(true));
        let alias = TimeShiftAlias::new("clip");
        let time_shift = controller.create(alias.clone(), point(), renderer.clone());

        let weak = Arc::downgrade(&time_shift) as std::sync::Weak<dyn BandwidthTarget>;
        drop(time_shift);

        weak.upgrade().unwrap().limit_bandwidth(Some(1_000_000));
        settle().await;
        assert_eq!(
            renderer.latest_time_shift().unwrap().bandwidth_limit(),
            Some(1_000_000)
        );

        assert!(controller.remove(&alias));
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_all_empties_registry() {
        let (controller, _events) = controller();
        let renderer = Arc::new(SimulatedRenderer::new(true));
        let a = controller.create(TimeShiftAlias::new("a"), point(), renderer.clone());
        let b = controller.create(TimeShiftAlias::new("b"), point(), renderer.clone());

        controller.dispose_all();
        controller.dispose_all();

        assert!(controller.aliases().is_empty());
        assert!(a.is_disposed());
        assert!(b.is_disposed());
    }
}
