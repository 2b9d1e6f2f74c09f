//! Connection rate limiting using the token bucket algorithm.
//!
//! Each client address gets its own bucket: tokens refill at a constant
//! rate, every connection attempt consumes one, and an empty bucket means
//! the connection is turned away with `421 Rate limit exceeded` before the
//! greeting.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Deserialize;

/// The admission layer's rate limiting capability.
///
/// Implementations must be internally thread-safe; one limiter is shared by
/// every accept on a listener.
pub trait RateLimiter: Send + Sync {
    /// Whether a connection from `ip` may proceed right now.
    fn is_allowed(&self, ip: IpAddr) -> bool;

    /// Record that a connection attempt from `ip` happened.
    fn record_request(&self, ip: IpAddr);
}

/// A limiter that admits everything. The default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimit;

impl RateLimiter for NoLimit {
    fn is_allowed(&self, _ip: IpAddr) -> bool {
        true
    }

    fn record_request(&self, _ip: IpAddr) {}
}

/// Configuration for [`TokenBucketLimiter`].
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained connections per second per address.
    #[serde(default = "default_connections_per_second")]
    pub connections_per_second: f64,

    /// Maximum burst (bucket capacity).
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_second: default_connections_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

const fn default_connections_per_second() -> f64 {
    10.0
}

const fn default_burst_size() -> u32 {
    20
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(connections_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: connections_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-address token bucket limiter.
#[derive(Debug, Default)]
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: DashMap<IpAddr, parking_lot::Mutex<TokenBucket>>,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Drop buckets that have fully refilled, to bound the table under
    /// address churn.
    pub fn prune(&self) {
        self.buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            bucket.refill();
            bucket.tokens < bucket.capacity
        });
    }

    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.buckets.len()
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn is_allowed(&self, ip: IpAddr) -> bool {
        let bucket = self.buckets.entry(ip).or_insert_with(|| {
            parking_lot::Mutex::new(TokenBucket::new(
                self.config.connections_per_second,
                self.config.burst_size,
            ))
        });

        let allowed = bucket.lock().try_consume();
        if !allowed {
            tracing::debug!(%ip, "Rate limit exceeded");
        }
        allowed
    }

    fn record_request(&self, _ip: IpAddr) {
        // Consumption happens in is_allowed; nothing further to record
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::{NoLimit, RateLimitConfig, RateLimiter, TokenBucket, TokenBucketLimiter};

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn token_bucket_consume() {
        let mut bucket = TokenBucket::new(10.0, 20);

        assert!(bucket.tokens >= 19.9);

        for _ in 0..20 {
            assert!(bucket.try_consume());
        }

        assert!(!bucket.try_consume());
    }

    #[test]
    fn token_bucket_refill() {
        let mut bucket = TokenBucket::new(10.0, 20);

        for _ in 0..20 {
            bucket.try_consume();
        }
        assert!(!bucket.try_consume());

        // Simulate one second passing
        bucket.last_refill = std::time::Instant::now()
            .checked_sub(std::time::Duration::from_secs(1))
            .unwrap();
        bucket.refill();

        assert!(bucket.tokens >= 9.9 && bucket.tokens <= 10.1);
        assert!(bucket.try_consume());
    }

    #[test]
    fn limiter_applies_burst_then_blocks() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            connections_per_second: 1.0,
            burst_size: 3,
        });

        for _ in 0..3 {
            assert!(limiter.is_allowed(ip(1)));
        }
        assert!(!limiter.is_allowed(ip(1)));

        // Other addresses have their own bucket
        assert!(limiter.is_allowed(ip(2)));
    }

    #[test]
    fn no_limit_admits_everything() {
        let limiter = NoLimit;
        for _ in 0..1000 {
            assert!(limiter.is_allowed(ip(1)));
        }
    }

    #[test]
    fn prune_drops_full_buckets() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            connections_per_second: 1000.0,
            burst_size: 1,
        });

        assert!(limiter.is_allowed(ip(1)));
        assert_eq!(limiter.tracked_addresses(), 1);

        // At 1000 tokens/sec the bucket is full again almost immediately
        std::thread::sleep(std::time::Duration::from_millis(10));
        limiter.prune();
        assert_eq!(limiter.tracked_addresses(), 0);
    }
}
