//! Backoff and pacing.
//!
//! Every wait in the engine goes through a [`Sleeper`] so tests can drive the
//! ladder, challenge loop and orchestrator without wall-clock delays.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    calls: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration passed to [`Sleeper::sleep`], in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<Duration> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(duration);
        }
    }
}

/// Delay before the retry that follows attempt `attempt` (0-based):
/// `base * 2^attempt`, saturating.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Human-like pauses between regions and between products.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub region_delay_min: Duration,
    pub region_delay_max: Duration,
    pub product_delay: Duration,
}

impl Pacing {
    /// No pauses at all; used by tests and one-off URL scrapes.
    #[must_use]
    pub fn none() -> Self {
        Self {
            region_delay_min: Duration::ZERO,
            region_delay_max: Duration::ZERO,
            product_delay: Duration::ZERO,
        }
    }

    /// Uniformly jittered delay within the region window.
    #[must_use]
    pub fn region_delay(&self) -> Duration {
        jitter_between(self.region_delay_min, self.region_delay_max)
    }
}

/// Uniform random duration in `[min, max]`; `min` when the window is empty.
#[must_use]
pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = max - min;
    min + span.mul_f64(rand::random::<f64>())
}
