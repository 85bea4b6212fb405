//! Cosmetic progress estimation for the job currently running.
//!
//! The estimator has no say in completion or retries: the orchestrator
//! polls the backend call and the ticker side by side and simply stops
//! ticking once the call resolves.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval_at};

/// Highest value shown while the backend has not answered yet.
pub const WAITING_CAP: f64 = 90.0;
/// Upper bound (exclusive) of one tick's increment, in percentage points.
pub const MAX_STEP: f64 = 10.0;

pub const FIRST_ATTEMPT_ETA: &str = "~10-15 seconds";

#[async_trait]
pub trait Ticker: Send {
    /// Resolves at the next tick.
    async fn tick(&mut self);
}

/// Hands out a fresh ticker for every running job.
pub trait TickSource: Send + Sync {
    fn ticker(&self) -> Box<dyn Ticker>;
}

pub struct IntervalTicker {
    interval: Interval,
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticks every `period`, first tick one period after the job starts.
pub struct IntervalTicks {
    period: Duration,
}

impl IntervalTicks {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl TickSource for IntervalTicks {
    fn ticker(&self) -> Box<dyn Ticker> {
        let mut interval = interval_at(tokio::time::Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Box::new(IntervalTicker { interval })
    }
}

pub struct ProgressEstimator {
    value: f64,
    rng: StdRng,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self { value: 0.0, rng }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// One tick: random step, clamped at [`WAITING_CAP`].
    pub fn advance(&mut self) -> f64 {
        if self.value < WAITING_CAP {
            let step = self.rng.random_range(0.0..MAX_STEP);
            self.value = (self.value + step).min(WAITING_CAP);
        }
        self.value
    }

    pub fn complete(&mut self) -> f64 {
        self.value = 100.0;
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn retry_eta(attempt: u32, max_attempts: u32) -> String {
    format!("Retrying... ({attempt}/{max_attempts})")
}
