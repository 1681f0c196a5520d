//! Cancellable one-shot timer.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A one-shot delayed callback that can be cancelled at any time.
///
/// Every `start` gets a fresh generation which is passed to the fire
/// callback. Owners that route the callback through a queue check it with
/// [`Watchdog::take_fired`], so a timer that fired just before being
/// cancelled or restarted is recognised as stale.
#[derive(Debug)]
pub struct Watchdog {
    name: &'static str,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: 0,
            task: None,
        }
    }

    /// Arm the watchdog, replacing any running timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&mut self, interval: Duration, on_fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let name = self.name;
        trace!(watchdog = name, generation, ?interval, "Watchdog armed");

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            trace!(watchdog = name, generation, "Watchdog fired");
            on_fire(generation);
        }));
    }

    /// Disarm the watchdog. Safe to call repeatedly and after firing.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Returns true while a timer is armed and has not been consumed.
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Accept a fire notification if it belongs to the armed timer.
    ///
    /// Returns false for stale generations. A successful take disarms the
    /// watchdog, so the same fire can only be accepted once.
    pub fn take_fired(&mut self, generation: u64) -> bool {
        if self.task.is_some() && generation == self.generation {
            self.task = None;
            self.generation = self.generation.wrapping_add(1);
            true
        } else {
            false
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_interval() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut watchdog = Watchdog::new("test");

        let counter = Arc::clone(&fired);
        watchdog.start(Duration::from_secs(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut watchdog = Watchdog::new("test");

        let counter = Arc::clone(&fired);
        watchdog.start(Duration::from_secs(1), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        watchdog.cancel();
        watchdog.cancel();
        assert!(!watchdog.is_running());

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_makes_previous_generation_stale() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let mut watchdog = Watchdog::new("test");

        watchdog.start(Duration::from_secs(1), |_| {});

        let seen_clone = Arc::clone(&seen);
        watchdog.start(Duration::from_secs(1), move |generation| {
            seen_clone.store(generation, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let generation = seen.load(Ordering::SeqCst);
        assert!(!watchdog.take_fired(generation.wrapping_sub(1)));
        assert!(watchdog.take_fired(generation));
        assert!(!watchdog.take_fired(generation));
        assert!(!watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_after_cancel_is_rejected() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let mut watchdog = Watchdog::new("test");

        let seen_clone = Arc::clone(&seen);
        watchdog.start(Duration::from_secs(1), move |generation| {
            seen_clone.store(generation, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        // The callback already ran; cancelling afterwards must still win.
        watchdog.cancel();
        assert!(!watchdog.take_fired(seen.load(Ordering::SeqCst)));
    }
}
