// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, time::Instant};

use parking_lot::Mutex;

use crate::config::RateLimitConfig;

/// Buckets idle for longer than this are dropped on the next sweep.
const IDLE_BUCKET_SECS: f64 = 600.0;
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Bucket capacity, reported as `x-ratelimit-limit`.
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the bucket is full again.
    pub reset_secs: u64,
    /// Milliseconds until one token is available; zero when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per key (API token, bearer subject or client address).
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
    checks: Mutex<u64>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.burst.max(1) as f64,
            refill_rate: config.requests_per_second.max(1) as f64,
            buckets: Mutex::new(HashMap::new()),
            checks: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        self.maybe_sweep(now);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let retry_after_ms = if allowed {
            0
        } else {
            (((1.0 - bucket.tokens) / self.refill_rate) * 1000.0).ceil() as u64
        };

        RateDecision {
            allowed,
            limit: self.capacity as u64,
            remaining: bucket.tokens.floor() as u64,
            reset_secs: ((self.capacity - bucket.tokens) / self.refill_rate).ceil() as u64,
            retry_after_ms,
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        let due = {
            let mut checks = self.checks.lock();
            *checks += 1;
            *checks % SWEEP_EVERY == 0
        };
        if due {
            let mut buckets = self.buckets.lock();
            let before = buckets.len();
            buckets.retain(|_, bucket| {
                now.saturating_duration_since(bucket.last_refill).as_secs_f64() < IDLE_BUCKET_SECS
            });
            tracing::debug!(dropped = before - buckets.len(), "Swept idle rate limit buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn limiter(rps: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_second: rps,
            burst,
        })
    }

    #[test]
    fn burst_then_reject() {
        let limiter = limiter(1, 3);
        let now = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("k", now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 3);
        }

        let rejected = limiter.check_at("k", now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_ms, 1000);
        assert_eq!(rejected.reset_secs, 3);
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = limiter(10, 1);
        let start = Instant::now();
        assert!(limiter.check_at("k", start).allowed);
        assert!(!limiter.check_at("k", start).allowed);
        assert!(limiter.check_at("k", start + Duration::from_millis(150)).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, 1);
        let now = Instant::now();
        assert!(limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
        assert!(!limiter.check_at("a", now).allowed);
    }
}
