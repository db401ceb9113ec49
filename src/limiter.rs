//! # Sliding-Window Rate Limiter
//!
//! Protects the reasoning backend from per-client overuse. Each client
//! (keyed by network address) gets a bucket of request timestamps inside
//! the trailing window; a request is admitted only while the bucket holds
//! fewer than `max_requests` live timestamps.
//!
//! ## Key Properties:
//! - **Deny without consume**: a denied check never appends a timestamp,
//!   so rejected probes do not eat into the client's quota
//! - **Eager pruning**: expired timestamps are dropped on every check
//! - **Bounded storage**: at most `max_keys` distinct clients are tracked;
//!   the least-recently-seen bucket is evicted when the cap is hit, and
//!   buckets idle longer than `idle_ttl` are dropped independently of the
//!   window arithmetic

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of a single admission check.
///
/// `remaining` and `retry_after_secs` feed the `X-RateLimit-Remaining` and
/// `Retry-After` response headers on the HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed toward the backend
    pub admitted: bool,

    /// Requests left in the current window after this decision
    pub remaining: u32,

    /// Seconds until a denied client should retry (0 when admitted)
    pub retry_after_secs: u64,
}

/// Per-client record of request timestamps within the trailing window.
struct Bucket {
    /// Admission timestamps, oldest first
    hits: VecDeque<Instant>,

    /// Last time this client was seen at all (admitted or not);
    /// drives idle-TTL and LRU eviction
    last_seen: Instant,
}

/// Sliding-window rate limiter shared across all sessions.
///
/// ## Thread Safety:
/// The bucket store is guarded by a Mutex. Every operation is synchronous
/// and O(window size), so the lock is held only briefly.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    window: Duration,
    max_requests: usize,
    max_keys: usize,
    idle_ttl: Duration,
}

impl RateLimiter {
    /// Create a limiter with explicit parameters.
    ///
    /// ## Parameters:
    /// - **window**: trailing interval in which requests are counted
    /// - **max_requests**: admissions allowed per window per client
    /// - **max_keys**: distinct clients tracked before LRU eviction
    /// - **idle_ttl**: bucket lifetime without any activity
    pub fn new(window: Duration, max_requests: usize, max_keys: usize, idle_ttl: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            window,
            max_requests,
            max_keys,
            idle_ttl,
        }
    }

    /// Check whether `client_id` may make a request right now.
    ///
    /// Never blocks and never fails. Appends the current time to the
    /// client's bucket only when the request is admitted.
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, Instant::now())
    }

    /// Admission check against an explicit "now" (test seam).
    pub fn check_at(&self, client_id: &str, now: Instant) -> RateLimitDecision {
        let mut buckets = self.buckets.lock().unwrap();

        // Idle buckets are reclaimed on every check; with max_keys capped
        // at ~1000 this scan stays cheap.
        buckets.retain(|_, b| now.duration_since(b.last_seen) < self.idle_ttl);

        if !buckets.contains_key(client_id) && buckets.len() >= self.max_keys {
            // Evict the least-recently-seen client to make room.
            if let Some(oldest) = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_seen)
                .map(|(k, _)| k.clone())
            {
                buckets.remove(&oldest);
            }
        }

        let bucket = buckets.entry(client_id.to_string()).or_insert_with(|| Bucket {
            hits: VecDeque::new(),
            last_seen: now,
        });
        bucket.last_seen = now;

        // Prune timestamps that have slid out of the window.
        while let Some(oldest) = bucket.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                bucket.hits.pop_front();
            } else {
                break;
            }
        }

        if bucket.hits.len() >= self.max_requests {
            // Denied: do not consume quota. Retry once the oldest live
            // timestamp slides out of the window. An empty bucket can only
            // be denied when max_requests is 0; report a full window then.
            let wait = match bucket.hits.front() {
                Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                None => self.window,
            };
            let retry_after_secs = wait.as_millis().div_ceil(1000) as u64;

            return RateLimitDecision {
                admitted: false,
                remaining: 0,
                retry_after_secs: retry_after_secs.max(1),
            };
        }

        bucket.hits.push_back(now);
        RateLimitDecision {
            admitted: true,
            remaining: (self.max_requests - bucket.hits.len()) as u32,
            retry_after_secs: 0,
        }
    }

    /// Number of client buckets currently tracked (for the health surface).
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// Drop buckets that have been idle longer than the TTL.
    ///
    /// Eviction also happens lazily inside `check`; this exists for the
    /// periodic background sweep so a quiet process still frees memory.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_seen) < self.idle_ttl);
        before - buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_secs(60), 30, 1000, Duration::from_secs(900))
    }

    #[test]
    fn admits_up_to_the_limit_then_denies() {
        let limiter = limiter();
        let now = Instant::now();

        for i in 0..30 {
            let decision = limiter.check_at("1.2.3.4", now + Duration::from_millis(i));
            assert!(decision.admitted, "request {} should be admitted", i + 1);
        }

        let denied = limiter.check_at("1.2.3.4", now + Duration::from_millis(30));
        assert!(!denied.admitted);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs > 0);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter();
        let now = Instant::now();

        assert_eq!(limiter.check_at("c", now).remaining, 29);
        assert_eq!(limiter.check_at("c", now).remaining, 28);
    }

    #[test]
    fn denied_checks_do_not_consume_quota() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2, 1000, Duration::from_secs(900));
        let now = Instant::now();

        assert!(limiter.check_at("c", now).admitted);
        assert!(limiter.check_at("c", now).admitted);

        // Hammer the denied path; the bucket must not grow.
        for _ in 0..10 {
            assert!(!limiter.check_at("c", now + Duration::from_secs(1)).admitted);
        }

        // Once the first two admissions slide out, the client is clean again
        // despite all the denied probes in between.
        let later = now + Duration::from_secs(61);
        let decision = limiter.check_at("c", later);
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2, 1000, Duration::from_secs(900));
        let now = Instant::now();

        assert!(limiter.check_at("c", now).admitted);
        assert!(limiter.check_at("c", now + Duration::from_secs(30)).admitted);
        assert!(!limiter.check_at("c", now + Duration::from_secs(31)).admitted);

        // First hit expires at +60s, second at +90s: one slot frees up.
        assert!(limiter.check_at("c", now + Duration::from_secs(61)).admitted);
        assert!(!limiter.check_at("c", now + Duration::from_secs(62)).admitted);
    }

    #[test]
    fn retry_after_reflects_oldest_timestamp() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, 1000, Duration::from_secs(900));
        let now = Instant::now();

        assert!(limiter.check_at("c", now).admitted);
        let denied = limiter.check_at("c", now + Duration::from_secs(10));
        // Oldest hit expires 50s from the denied check; ceil keeps it at 50.
        assert_eq!(denied.retry_after_secs, 50);
    }

    #[test]
    fn distinct_clients_have_independent_quotas() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, 1000, Duration::from_secs(900));
        let now = Instant::now();

        assert!(limiter.check_at("a", now).admitted);
        assert!(!limiter.check_at("a", now).admitted);
        assert!(limiter.check_at("b", now).admitted);
    }

    #[test]
    fn key_capacity_evicts_least_recently_seen() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5, 2, Duration::from_secs(900));
        let now = Instant::now();

        limiter.check_at("a", now);
        limiter.check_at("b", now + Duration::from_secs(1));
        // Third client forces out "a", the least recently seen.
        limiter.check_at("c", now + Duration::from_secs(2));

        assert_eq!(limiter.tracked_clients(), 2);

        // "a" comes back with a fresh bucket (full quota again).
        let decision = limiter.check_at("a", now + Duration::from_secs(3));
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn idle_buckets_expire_independently_of_the_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5, 1000, Duration::from_secs(900));
        let now = Instant::now();

        limiter.check_at("a", now);
        limiter.check_at("b", now);
        assert_eq!(limiter.tracked_clients(), 2);

        // 15 minutes of silence reclaims both buckets.
        assert_eq!(limiter.evict_idle_at(now + Duration::from_secs(901)), 2);
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
