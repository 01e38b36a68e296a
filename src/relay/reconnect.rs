//! Backoff schedule for re-establishing the relay controller connection.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based), with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// `random` must be in `[0.0, 1.0)`; it maps onto `[-jitter, +jitter]`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(max_ms) as f64;

        let factor = 1.0 + (random * 2.0 - 1.0) * self.jitter;
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }
}
