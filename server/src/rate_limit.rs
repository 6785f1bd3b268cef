//! In-process token bucket rate limiting (§4.7): session creation ≤10/min/identity, all
//! other API calls ≤100/min/identity. No external rate-limiting crate is present in the
//! corpus's dependency stacks, so this is hand-rolled, the way the teacher hand-rolls other
//! small bits of server-side bookkeeping rather than reaching for a crate it doesn't already use.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One bucket per (identity, category). `identity` is the bearer token, or `"anon"` under
/// `AuthMode::None`. Refills continuously rather than on a fixed window so a burst right at
/// a window boundary can't double a client's effective rate.
pub struct RateLimiter {
    buckets: DashMap<(String, &'static str), Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    /// Returns `true` if the call is allowed under `category`'s per-minute cap, consuming
    /// one token. `cap` is the bucket's capacity and refill rate (tokens/minute).
    pub fn check(&self, identity: &str, category: &'static str, cap_per_minute: u32) -> bool {
        let key = (identity.to_string(), category);
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(Bucket { tokens: cap_per_minute as f64, last_refill: Instant::now() }));
        let mut bucket = entry.lock().expect("rate limiter bucket mutex");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() * (cap_per_minute as f64 / 60.0);
        bucket.tokens = (bucket.tokens + refill).min(cap_per_minute as f64);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub const SESSION_CREATE_CAP_PER_MINUTE: u32 = 10;
pub const OTHER_API_CAP_PER_MINUTE: u32 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_recovers_over_time() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("a", "x", 3));
        }
        assert!(!limiter.check("a", "x", 3));
    }

    #[test]
    fn identities_are_isolated() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("a", "x", 1));
        assert!(!limiter.check("a", "x", 1));
        assert!(limiter.check("b", "x", 1));
    }

    #[test]
    fn categories_are_isolated() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("a", "create", 1));
        assert!(limiter.check("a", "other", 1));
    }

    #[test]
    fn refills_over_elapsed_time() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("a", "x", 1));
        assert!(!limiter.check("a", "x", 1));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check("a", "x", 60));
    }
}
