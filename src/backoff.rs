//! Exponential backoff with jitter for query polling.
//!
//! Intervals double from `min` up to `max`. Jitter adds up to
//! `jitter * interval`, but an interval is never shorter than the one before
//! it and never longer than `max`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Number of intervals handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered interval for the current attempt.
    fn base(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.min.saturating_mul(factor).min(self.max)
    }

    /// The next interval to wait.
    pub fn next_interval(&mut self) -> Duration {
        let base = self.base();
        let spread = base.mul_f64(self.jitter * rand::thread_rng().r#gen::<f64>());
        let interval = (base + spread).clamp(self.last, self.max);
        self.attempt = self.attempt.saturating_add(1);
        self.last = interval;
        interval
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_interval())
    }
}
