//! Per-host token buckets with multiplicative decay on congestion.
//!
//! Each host gets a bucket holding at most `burst` tokens and refilled at
//! its current rate. A fresh host starts full at the configured rate. Every
//! 429 from a host multiplies its rate by `decay_factor`, down to
//! `min_rate`. Rates never climb back on their own: a host only gets its
//! original rate back when it is dropped from the limiter and re-added.
//!
//! The limiter itself never sleeps. [`RateLimiter::try_acquire`] either
//! takes a token or says how long until one is available, so callers can
//! wait outside whatever lock guards the limiter.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Token bucket state for one host.
#[derive(Debug, Clone)]
pub struct HostBucket {
    /// Tokens per second.
    pub rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl HostBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            rate: config.requests_per_second,
            tokens: f64::from(config.burst.max(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(burst);
        self.last_refill = now;
    }
}

/// Token buckets for every host the client talks to.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    hosts: HashMap<String, HostBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hosts: HashMap::new(),
        }
    }

    fn burst(&self) -> f64 {
        f64::from(self.config.burst.max(1))
    }

    /// Take a token for `host`, or return the wait until one is available.
    pub fn try_acquire(&mut self, host: &str, now: Instant) -> Result<(), Duration> {
        let burst = self.burst();
        let config = &self.config;
        let bucket = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostBucket::new(config, now));
        bucket.refill(burst, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - bucket.tokens;
        let wait = Duration::from_secs_f64(missing / bucket.rate.max(f64::MIN_POSITIVE));
        debug!(peer = %host, ?wait, rate = bucket.rate, "rate_limiter: waiting for token");
        Err(wait)
    }

    /// Slow `host` down after a 429. Returns the new rate.
    pub fn decay(&mut self, host: &str) -> f64 {
        let now = Instant::now();
        let burst = self.burst();
        let config = &self.config;
        let bucket = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostBucket::new(config, now));
        bucket.refill(burst, now);
        bucket.rate = (bucket.rate * config.decay_factor).max(config.min_rate);
        debug!(peer = %host, rate = bucket.rate, "rate_limiter: rate decayed");
        bucket.rate
    }

    /// Current rate of `host`, if it has been seen.
    pub fn rate(&self, host: &str) -> Option<f64> {
        self.hosts.get(host).map(|b| b.rate)
    }

    /// Drop every host for which `keep` returns `false`.
    pub fn retain_hosts(&mut self, keep: impl Fn(&str) -> bool) {
        self.hosts.retain(|host, _| {
            let kept = keep(host);
            if !kept {
                debug!(peer = %host, "rate_limiter: host removed");
            }
            kept
        });
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    /// First request to a fresh host goes through immediately.
    #[test]
    fn fresh_host_has_one_token() {
        let mut rl = limiter();
        let now = Instant::now();
        assert!(rl.try_acquire("a.example", now).is_ok());
    }

    /// Burst 1: the second request in the same instant must wait a full second.
    #[test]
    fn second_request_waits_one_second() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.try_acquire("a.example", now).unwrap();
        let wait = rl.try_acquire("a.example", now).unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[test]
    fn token_refills_after_interval() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.try_acquire("a.example", now).unwrap();
        assert!(rl.try_acquire("a.example", now + Duration::from_millis(500)).is_err());
        assert!(rl.try_acquire("a.example", now + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn idle_host_does_not_accumulate_beyond_burst() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.try_acquire("a.example", now).unwrap();
        let later = now + Duration::from_secs(60);
        assert!(rl.try_acquire("a.example", later).is_ok());
        assert!(rl.try_acquire("a.example", later).is_err());
    }

    #[test]
    fn hosts_are_independent() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.try_acquire("a.example", now).unwrap();
        assert!(rl.try_acquire("b.example", now).is_ok());
    }

    // --- Decay ---

    #[test]
    fn decay_multiplies_rate() {
        let mut rl = limiter();
        assert!((rl.decay("a.example") - 0.9).abs() < 1e-9);
        assert!((rl.decay("a.example") - 0.81).abs() < 1e-9);
        assert!((rl.rate("a.example").unwrap() - 0.81).abs() < 1e-9);
    }

    #[test]
    fn decay_has_floor() {
        let mut rl = limiter();
        for _ in 0..100 {
            rl.decay("a.example");
        }
        assert_eq!(rl.rate("a.example"), Some(0.1));
    }

    #[test]
    fn decayed_host_waits_longer() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.try_acquire("a.example", now).unwrap();
        rl.decay("a.example");
        let wait = rl.try_acquire("a.example", now).unwrap_err();
        assert!(wait > Duration::from_secs(1));
    }

    #[test]
    fn decay_does_not_touch_other_hosts() {
        let mut rl = limiter();
        rl.try_acquire("b.example", Instant::now()).unwrap();
        rl.decay("a.example");
        assert_eq!(rl.rate("b.example"), Some(1.0));
    }

    #[test]
    fn rate_never_recovers_while_tracked() {
        let mut rl = limiter();
        let now = Instant::now();
        rl.decay("a.example");
        rl.try_acquire("a.example", now + Duration::from_secs(3600)).unwrap();
        assert!((rl.rate("a.example").unwrap() - 0.9).abs() < 1e-9);
    }

    // --- Lifecycle ---

    #[test]
    fn retain_resets_removed_hosts() {
        let mut rl = limiter();
        rl.decay("a.example");
        rl.decay("b.example");
        rl.retain_hosts(|h| h == "b.example");
        assert_eq!(rl.host_count(), 1);
        assert_eq!(rl.rate("a.example"), None);

        rl.try_acquire("a.example", Instant::now()).unwrap();
        assert_eq!(rl.rate("a.example"), Some(1.0));
    }
}
