//! Per-key token bucket rate limiting.
//!
//! One GCRA limiter per key (repository). Refill is continuous at
//! `requests_per_second`, capacity is `burst`, and a rejected call consumes
//! nothing.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::{Error, Result};

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter keyed by an arbitrary string.
pub struct RateLimiter {
    quota: Quota,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    ///
    /// # Errors
    ///
    /// Fails when the rate is not a positive finite number or the burst is
    /// zero.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        Self::with_rate(config.requests_per_second, config.burst)
    }

    /// Create a limiter refilling `rps` tokens per second up to `burst`.
    pub fn with_rate(rps: f64, burst: u32) -> Result<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(Error::Config(format!(
                "rate limit must be a positive number, got {rps}"
            )));
        }
        let burst = NonZeroU32::new(burst)
            .ok_or_else(|| Error::Config("rate limit burst must be at least 1".to_string()))?;

        let period = Duration::try_from_secs_f64(1.0 / rps)
            .map_err(|e| Error::Config(format!("rate limit out of range: {e}")))?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| Error::Config(format!("rate limit too high: {rps}")))?
            .allow_burst(burst);

        Ok(Self {
            quota,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    /// Take one token for `key` if available. Never blocks.
    pub fn allow(&self, key: &str) -> bool {
        let allowed = self.bucket(key).check().is_ok();
        if !allowed {
            debug!(key = %key, "Rate limit exceeded");
        }
        allowed
    }

    /// Wait until a token for `key` is available, then take it.
    pub async fn wait(&self, key: &str) {
        let bucket = self.bucket(key);
        bucket.until_ready().await;
    }

    /// Drop every bucket; subsequent calls start from a full burst.
    pub fn reset(&self) {
        self.buckets.write().clear();
    }

    /// Number of distinct keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether no key has been seen since construction or the last reset.
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(GovernorLimiter::direct(self.quota))),
        )
    }
}
