//! Retry delay policies for [`RateLimitingQueue`](super::workqueue::RateLimitingQueue).
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<K>: Send + Sync + fmt::Debug {
    /// Delay before `item` is delivered again. Records one more retry.
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`; its next retry starts from scratch.
    fn forget(&self, item: &K);

    /// Retries recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> usize;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    /// Backoff starting at `base_delay` and never exceeding `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ItemExponentialFailureRateLimiter {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<K> Default for ItemExponentialFailureRateLimiter<K> {
    /// 5 ms doubling up to 1000 s.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + fmt::Debug,
{
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let exp = failures.entry(item.clone()).or_insert(0);
        let current = *exp;
        *exp = exp.saturating_add(1);

        match 1u32
            .checked_shl(current)
            .and_then(|factor| self.base_delay.checked_mul(factor))
        {
            Some(backoff) if backoff < self.max_delay => backoff,
            _ => self.max_delay,
        }
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .map_or(0, |n| *n as usize)
    }
}

// token bucket that hands out reservations, so the tokens may go negative
#[derive(Debug)]
struct Bucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn reserve<F>(&mut self, now: F) -> Duration
    where
        F: Fn() -> Instant,
    {
        let now = now();
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.tokens = f64::min(self.tokens + elapsed.as_secs_f64() * self.qps, self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            // too far out to represent when qps is tiny
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

/// Overall token bucket shared by every item.
#[derive(Debug)]
pub struct BucketRateLimiter {
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// `qps` tokens per second, holding at most `burst`.
    ///
    /// A `qps` that is not a positive finite number disables the limit.
    pub fn new(qps: f64, burst: u32) -> Self {
        BucketRateLimiter {
            bucket: Mutex::new(Bucket {
                qps: if qps.is_finite() { qps } else { 0.0 },
                burst: f64::from(burst),
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    fn reserve<F>(&self, now: F) -> Duration
    where
        F: Fn() -> Instant,
    {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(now)
    }
}

impl Default for BucketRateLimiter {
    /// 10 qps with a burst of 100.
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve(Instant::now)
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> usize {
        0
    }
}

/// The longest delay of several limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine `limiters`; every one of them records each retry.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        MaxOfRateLimiter { limiters }
    }
}

impl<K> fmt::Debug for MaxOfRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters)
            .finish()
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or_default()
    }
}

/// Per-item exponential backoff combined with an overall 10 qps bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::<K>::default()),
        Box::new(BucketRateLimiter::default()),
    ])
}
