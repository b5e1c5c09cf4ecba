//! Reconnect backoff with jitter.
//!
//! Mirrors the shape of the teacher's `next_reconnect_delay` /
//! `jitter_delay`: exponential growth capped at a max delay, plus a jitter
//! term to avoid thundering-herd reconnects.

use std::time::Duration;

use rand::Rng;

/// Backoff policy: `min(initial * multiplier^attempt, max)` with optional
/// 0%-`jitter_pct`% additional jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Compute the delay before the `attempt`-th reconnect (0-based: the
    /// first retry after the initial connection failure is `attempt = 0`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);
        let mut delay = Duration::from_millis(capped_ms as u64);

        if self.jitter {
            let jitter_frac = rand::thread_rng().gen_range(0.0..0.25);
            let jitter_ms = (delay.as_millis() as f64 * jitter_frac) as u64;
            delay += Duration::from_millis(jitter_ms);
        }

        delay
    }
}
