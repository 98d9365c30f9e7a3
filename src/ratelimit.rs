use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last: Instant,
}

/// Token bucket limiter keyed by string (typically remote address +
/// endpoint). A single lock over the map is fine at expected request
/// rates.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true iff at least one token is available for `key`,
    /// consuming it. Buckets start full and refill at
    /// `refill_per_sec`, capped at `capacity`.
    pub fn allow(&self, key: &str, capacity: f64, refill_per_sec: f64) -> bool {
        self.allow_at(key, capacity, refill_per_sec, Instant::now())
    }

    fn allow_at(&self, key: &str, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        let b = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            capacity,
            refill_rate: refill_per_sec,
            last: now,
        });

        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        if elapsed > 0.0 {
            b.tokens = (b.tokens + elapsed * b.refill_rate).min(b.capacity);
            b.last = now;
        }
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_capacity_then_denied() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        assert!(rl.allow_at("k", 2.0, 1.0, t0));
        assert!(rl.allow_at("k", 2.0, 1.0, t0));
        assert!(!rl.allow_at("k", 2.0, 1.0, t0));
    }

    #[test]
    fn refills_one_token_per_second() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        assert!(rl.allow_at("k", 2.0, 1.0, t0));
        assert!(rl.allow_at("k", 2.0, 1.0, t0));
        assert!(!rl.allow_at("k", 2.0, 1.0, t0));
        assert!(rl.allow_at("k", 2.0, 1.0, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn idle_bucket_refills_to_capacity_not_beyond() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            rl.allow_at("k", 5.0, 2.0, t0);
        }
        // After cap/rate seconds idle the bucket is full again.
        let t1 = t0 + Duration::from_secs_f64(5.0 / 2.0);
        for _ in 0..5 {
            assert!(rl.allow_at("k", 5.0, 2.0, t1));
        }
        assert!(!rl.allow_at("k", 5.0, 2.0, t1));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        assert!(rl.allow_at("a", 1.0, 1.0, t0));
        assert!(!rl.allow_at("a", 1.0, 1.0, t0));
        assert!(rl.allow_at("b", 1.0, 1.0, t0));
    }
}
