//! Redelivery delay policies. Consulted by the worker driver, never by the queue.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Maps a key and its consecutive-failure count to a redelivery delay.
pub trait RateLimiter<K>: Send + Sync {
    fn next_delay(&self, key: &K, retries: u32) -> Duration;

    /// Drop any per-key state. Stateless policies ignore it.
    fn forget(&self, _key: &K) {}
}

/// `base * 2^retries`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    pub fn delay_for(&self, retries: u32) -> Duration {
        1u32.checked_shl(retries)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self { Self::new(Duration::from_millis(5), Duration::from_secs(1000)) }
}

impl<K> RateLimiter<K> for ExponentialBackoff {
    fn next_delay(&self, _key: &K, retries: u32) -> Duration { self.delay_for(retries) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall redelivery rate cap shared by every key: `qps` tokens per second,
/// at most `burst` banked. A call that finds the bucket empty reserves a
/// future token and returns the wait until it is available.
pub struct TokenBucket {
    qps: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: f64::from(burst), last: Instant::now() }) }
    }

    pub fn reserve(&self) -> Duration {
        if self.qps <= 0.0 || !self.qps.is_finite() {
            return Duration::ZERO;
        }
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(f64::from(self.burst));
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn next_delay(&self, _key: &K, _retries: u32) -> Duration { self.reserve() }
}

/// Worst case of several limiters. Every limiter is consulted on each call.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn next_delay(&self, key: &K, retries: u32) -> Duration {
        self.limiters.iter().map(|l| l.next_delay(key, retries)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with a 10 qps / 100
/// burst overall bucket.
pub fn default_controller_rate_limiter<K: 'static>() -> MaxOf<K> {
    MaxOf::new(vec![Box::new(ExponentialBackoff::default()), Box::new(TokenBucket::new(10.0, 100))])
}
