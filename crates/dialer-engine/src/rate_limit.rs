//! Per-trunk token buckets
//!
//! Buckets live in memory and are authoritative there; snapshots are
//! persisted periodically on a best-effort basis and restored on startup
//! according to [`BucketRestorePolicy`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{BucketRestorePolicy, RateLimitConfig};
use crate::types::{Trunk, TrunkId};

/// Token bucket with passive refill
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::with_tokens(capacity, refill_rate, capacity)
    }

    pub fn with_tokens(capacity: f64, refill_rate: f64, tokens: f64) -> Self {
        Self {
            tokens: tokens.clamp(0.0, capacity),
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self, n: f64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Refill up to `now`, then take `n` tokens if that many are available.
    /// A failed attempt leaves the token count untouched.
    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Change the limit in place; tokens above the new capacity are dropped
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.refill(Instant::now());
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.min(capacity);
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Persisted form of one trunk's bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub trunk_id: TrunkId,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub captured_at: DateTime<Utc>,
}

/// Bucket size for a CPS limit. A bucket must hold at least one whole call,
/// otherwise limits below 1 CPS could never dial.
fn capacity_for(cps: f64) -> f64 {
    cps.max(1.0)
}

/// Lazily created bucket per trunk, sized from the trunk's CPS limit
pub struct RateLimiter {
    buckets: DashMap<TrunkId, Mutex<TokenBucket>>,
    default_cps: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_cps: config.default_cps,
        }
    }

    fn cps_for(&self, trunk: &Trunk) -> f64 {
        if trunk.cps_limit > 0.0 {
            trunk.cps_limit
        } else {
            self.default_cps
        }
    }

    /// Take one token from the trunk's bucket
    pub fn try_acquire(&self, trunk: &Trunk) -> bool {
        let cps = self.cps_for(trunk);
        let capacity = capacity_for(cps);
        let entry = self
            .buckets
            .entry(trunk.id.clone())
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, cps)));

        let mut bucket = entry.lock();
        if bucket.refill_rate() != cps || bucket.capacity() != capacity {
            debug!(trunk_id = %trunk.id, cps, "Trunk CPS changed, resizing bucket");
            bucket.reconfigure(capacity, cps);
        }
        bucket.try_consume(1.0)
    }

    pub fn available(&self, trunk_id: &TrunkId) -> Option<f64> {
        self.buckets
            .get(trunk_id)
            .map(|bucket| bucket.lock().available_at(Instant::now()))
    }

    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = Instant::now();
        let captured_at = Utc::now();
        let mut snapshots: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let mut bucket = entry.value().lock();
                BucketSnapshot {
                    trunk_id: entry.key().clone(),
                    tokens: bucket.available_at(now),
                    capacity: bucket.capacity(),
                    refill_rate: bucket.refill_rate(),
                    captured_at,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.trunk_id.cmp(&b.trunk_id));
        snapshots
    }

    /// Recreate buckets from persisted snapshots.
    ///
    /// With [`BucketRestorePolicy::Persisted`] the saved token count is
    /// credited with the refill owed for the wall-clock time since capture.
    pub fn restore(&self, snapshots: &[BucketSnapshot], policy: BucketRestorePolicy) {
        let now = Utc::now();
        for snap in snapshots {
            let capacity = snap.capacity.max(capacity_for(snap.refill_rate));
            let tokens = match policy {
                BucketRestorePolicy::FullCapacity => capacity,
                BucketRestorePolicy::Persisted => {
                    let elapsed = (now - snap.captured_at).num_milliseconds().max(0) as f64 / 1000.0;
                    (snap.tokens + elapsed * snap.refill_rate).min(capacity)
                }
            };
            self.buckets.insert(
                snap.trunk_id.clone(),
                Mutex::new(TokenBucket::with_tokens(capacity, snap.refill_rate, tokens)),
            );
        }
        info!("Restored {} rate-limit buckets ({:?})", snapshots.len(), policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_never_exceeds_rate() {
        let mut bucket = TokenBucket::new(2.0, 2.0);
        let start = Instant::now();

        assert!(bucket.try_consume_at(1.0, start));
        assert!(bucket.try_consume_at(1.0, start));
        assert!(!bucket.try_consume_at(1.0, start));

        // half a second refills exactly one token
        let later = start + Duration::from_millis(500);
        assert!(bucket.try_consume_at(1.0, later));
        assert!(!bucket.try_consume_at(1.0, later));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket::with_tokens(5.0, 1.0, 0.0);
        let much_later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(bucket.available_at(much_later), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_consume_keeps_tokens() {
        let mut bucket = TokenBucket::with_tokens(3.0, 0.0, 0.5);
        let now = Instant::now();
        assert!(!bucket.try_consume_at(1.0, now));
        assert_eq!(bucket.available_at(now), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_per_trunk_buckets() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        let a = Trunk::new("trunk-a", "carrier-a", 1.0);
        let b = Trunk::new("trunk-b", "carrier-a", 1.0);

        assert!(limiter.try_acquire(&a));
        assert!(!limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&b));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_restore() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        let trunk = Trunk::new("trunk-a", "carrier-a", 10.0);
        for _ in 0..10 {
            assert!(limiter.try_acquire(&trunk));
        }
        let snaps = limiter.snapshot();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].tokens < 1.0);

        let persisted = RateLimiter::new(&RateLimitConfig::default());
        persisted.restore(&snaps, BucketRestorePolicy::Persisted);
        assert!(persisted.available(&trunk.id).unwrap() < 10.0);

        let full = RateLimiter::new(&RateLimitConfig::default());
        full.restore(&snaps, BucketRestorePolicy::FullCapacity);
        assert_eq!(full.available(&trunk.id), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_one_cps_trunk_dials_at_its_rate() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        let slow = Trunk::new("trunk-slow", "carrier-a", 0.5);

        assert!(limiter.try_acquire(&slow));
        assert!(!limiter.try_acquire(&slow));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.try_acquire(&slow));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire(&slow));

        let snaps = limiter.snapshot();
        assert_eq!(snaps[0].capacity, 1.0);
        assert_eq!(snaps[0].refill_rate, 0.5);

        let restored = RateLimiter::new(&RateLimitConfig::default());
        restored.restore(&snaps, BucketRestorePolicy::FullCapacity);
        assert_eq!(restored.available(&slow.id), Some(1.0));
    }
}
