use chrono::Utc;
use dashmap::DashMap;

use crate::error::ServiceError;

/// Sliding-window rate limiter keyed by an arbitrary string.
///
/// The chunk coordinator keys it by "{session}:{stream}" to bound signing
/// request bursts per stream. Timestamps inside the window are kept per key;
/// anything older than the window is discarded on the next consume.
pub struct SlidingWindowLimiter {
    limit: usize,
    window_ms: i64,
    buckets: DashMap<String, Vec<i64>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window_ms: i64) -> Self {
        Self {
            limit,
            window_ms,
            buckets: DashMap::new(),
        }
    }

    /// Record one request for `key`, rejecting when the window is full
    pub fn consume(&self, key: &str) -> Result<(), ServiceError> {
        self.consume_at(key, Utc::now().timestamp_millis())
    }

    /// Consume with an explicit clock (for testing)
    pub fn consume_at(&self, key: &str, now_ms: i64) -> Result<(), ServiceError> {
        let window_start = now_ms - self.window_ms;
        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        bucket.retain(|&ts| ts >= window_start);
        if bucket.len() >= self.limit {
            return Err(ServiceError::RateLimited(format!(
                "Rate limit exceeded for {}",
                key
            )));
        }
        bucket.push(now_ms);
        Ok(())
    }
}
