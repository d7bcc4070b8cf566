//! Periodic fleet scan trigger.

use crate::services::dispatcher::{Dispatcher, Job};
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Submits a fleet sweep on a fixed interval.
///
/// Ticks are independent: a sweep is submitted even if the previous one is
/// still being worked on.
pub struct Scheduler {
    dispatcher: Arc<dyn Dispatcher>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Tick until `shutdown` fires. The first tick is immediate.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.interval.as_secs(), "scan scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
        tracing::info!("scan scheduler stopped");
    }

    fn tick(&self) {
        if let Err(err) = self.dispatcher.submit(Job::SweepFleet) {
            tracing::warn!(error = %err, "scheduled fleet scan not submitted");
        }
    }
}
