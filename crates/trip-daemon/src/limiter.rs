//! Sharded token-bucket rate limiters.
//!
//! One bucket per key (identity or relying-party peer), sharded across
//! independent locks to keep contention off the hot path. Tokens are
//! stored scaled by 1000 so refill arithmetic stays integral, and each
//! bucket's token count and refill timestamp live under the same lock
//! so refill and acquire are a single atomic step.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

/// Shards in a keyed limiter.
const SHARD_COUNT: usize = 16;

/// Token scale for sub-token refill precision.
const TOKEN_SCALE: u64 = 1000;

#[derive(Debug)]
struct Bucket {
    /// Tokens scaled by [`TOKEN_SCALE`].
    tokens: u64,
    last_refill: Instant,
}

/// Keyed token-bucket limiter.
#[derive(Debug)]
pub struct KeyedLimiter {
    shards: Vec<Mutex<HashMap<u64, Bucket>>>,
    /// Tokens per second.
    rate: u64,
    /// Burst capacity.
    burst: u64,
}

impl KeyedLimiter {
    /// Creates a limiter refilling `rate` tokens per second up to
    /// `burst`.
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            rate,
            burst,
        }
    }

    /// Attempts to take one token for `key`.
    ///
    /// Returns `false` when the bucket is empty; the caller surfaces
    /// this immediately, never queues.
    pub fn try_acquire(&self, key: &[u8]) -> bool {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hashed = hasher.finish();

        #[allow(clippy::cast_possible_truncation)]
        let shard = &self.shards[(hashed % SHARD_COUNT as u64) as usize];
        let mut buckets = shard.lock().expect("lock poisoned");

        let now = Instant::now();
        let bucket = buckets.entry(hashed).or_insert_with(|| Bucket {
            tokens: self.burst * TOKEN_SCALE,
            last_refill: now,
        });

        // Refill and acquire under one lock.
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            let refill = elapsed_ms.saturating_mul(self.rate);
            bucket.tokens = (bucket.tokens.saturating_add(refill)).min(self.burst * TOKEN_SCALE);
            bucket.last_refill = now;
        }

        if bucket.tokens < TOKEN_SCALE {
            return false;
        }
        bucket.tokens -= TOKEN_SCALE;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_empty() {
        let limiter = KeyedLimiter::new(1, 3);
        let key = b"identity-a";

        assert!(limiter.try_acquire(key));
        assert!(limiter.try_acquire(key));
        assert!(limiter.try_acquire(key));
        assert!(!limiter.try_acquire(key));
    }

    #[test]
    fn keys_have_independent_buckets() {
        let limiter = KeyedLimiter::new(1, 1);

        assert!(limiter.try_acquire(b"identity-a"));
        assert!(!limiter.try_acquire(b"identity-a"));
        assert!(limiter.try_acquire(b"identity-b"));
    }

    #[test]
    fn refills_over_time() {
        let limiter = KeyedLimiter::new(1000, 1);
        let key = b"identity-a";

        assert!(limiter.try_acquire(key));
        assert!(!limiter.try_acquire(key));

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.try_acquire(key));
    }
}
