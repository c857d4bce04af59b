//! Per-worker request pacing.
//!
//! Every worker owns its own throttle, so the aggregate rate of a run is
//! roughly `qps * concurrency`.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Fixed-interval gate. Disabled when the rate is zero.
#[derive(Debug)]
pub struct Throttle {
    interval: Option<Interval>,
}

impl Throttle {
    pub fn new(qps: f64) -> Self {
        let interval = period(qps).map(|period| {
            // First permit arrives one period after start, like every other.
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        Self { interval }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next permit. Returns immediately when disabled.
    pub async fn tick(&mut self) {
        if let Some(interval) = self.interval.as_mut() {
            interval.tick().await;
        }
    }
}

/// Interval between two requests of one worker, truncated to whole
/// microseconds.
pub fn period(qps: f64) -> Option<Duration> {
    if !qps.is_finite() || qps <= 0.0 {
        return None;
    }
    let micros = (1e6 / qps) as u64;
    Some(Duration::from_micros(micros.max(1)))
}
