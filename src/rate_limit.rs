//! Token-bucket rate limiter shared by all concurrent validation runs.
//!
//! Every query attempt takes a token first, so adding runs never multiplies
//! the request rate seen by the query endpoint. A throttling response from
//! the endpoint empties the bucket for everyone.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Limits for the query endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum sustained requests per second.
    pub sustained_rps: u32,
    /// Maximum burst size.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sustained_rps: 2,
            burst: 4,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_check: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        // sustained_rps >= 1 keeps the wait computation finite.
        let mut config = config;
        config.sustained_rps = config.sustained_rps.max(1);
        config.burst = config.burst.max(1);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                last_check: Instant::now(),
                blocked_until: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take a token if one is available, otherwise report how long until
    /// one will be.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Err(until - now);
            }
            bucket.blocked_until = None;
            bucket.last_check = now;
            bucket.tokens = bucket.tokens.max(1.0);
        }

        let elapsed = now.duration_since(bucket.last_check).as_secs_f64();
        bucket.last_check = now;
        let rps = f64::from(self.config.sustained_rps);
        bucket.tokens = (bucket.tokens + elapsed * rps).min(f64::from(self.config.burst));

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - bucket.tokens) / rps;
            Err(Duration::from_secs_f64(wait_secs).max(Duration::from_millis(1)))
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Empty the bucket and hold all callers off for `pause`.
    pub fn throttle(&self, pause: Duration) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let until = Instant::now() + pause;
        bucket.tokens = 0.0;
        bucket.blocked_until = Some(bucket.blocked_until.map_or(until, |b| b.max(until)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let limiter = RateLimiter::new(RateLimitConfig {
            sustained_rps: 2,
            burst: 3,
        });
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
        }
        let wait = limiter.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_token() {
        let limiter = RateLimiter::new(RateLimitConfig {
            sustained_rps: 1,
            burst: 1,
        });
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_blocks_everyone() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.throttle(Duration::from_secs(5));
        assert!(limiter.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn zero_config_is_clamped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            sustained_rps: 0,
            burst: 0,
        });
        assert_eq!(limiter.config().sustained_rps, 1);
        assert!(limiter.try_acquire().is_ok());
    }
}
