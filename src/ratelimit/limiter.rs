//! Core token-bucket rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::verdict::Verdict;
use crate::cache::{Cache, CacheError, MemoryCache};
use crate::clock::{Clock, SystemClock};

const BUCKET_KEY_PREFIX: &str = "rl:bucket:";
const LAST_FILL_KEY_PREFIX: &str = "rl:fill:";

/// Expiration applied to stored bucket state when none is configured.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

fn bucket_key(key: &str) -> String {
    format!("{BUCKET_KEY_PREFIX}{key}")
}

fn last_fill_key(key: &str) -> String {
    format!("{LAST_FILL_KEY_PREFIX}{key}")
}

/// Options for constructing a [`RateLimiter`].
#[derive(Clone)]
pub struct LimiterOptions {
    /// Sustained permits generated per second
    pub max_rate_per_second: f64,
    /// Most permits a bucket can hold
    pub max_burst: u64,
    /// Where bucket state lives; a fresh [`MemoryCache`] when `None`
    pub cache: Option<Arc<dyn Cache>>,
    /// Expiration for stored state; zero means [`DEFAULT_CACHE_TTL`]
    pub cache_ttl: Duration,
    /// Time source; the system clock when `None`
    pub clock: Option<Arc<dyn Clock>>,
}

impl LimiterOptions {
    pub fn new(max_rate_per_second: f64, max_burst: u64) -> Self {
        Self {
            max_rate_per_second,
            max_burst,
            cache: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            clock: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// Bucket state computed for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Refill {
    bucket: i64,
    last_fill: i64,
}

/// A per-key token-bucket rate limiter.
///
/// All bucket state lives in the injected [`Cache`]; the limiter itself is
/// immutable and can be shared across tasks. If the cache cannot be read the
/// limiter fails open: it behaves as if the bucket were full and no time had
/// passed, so a broken store disables limiting instead of blocking traffic.
pub struct RateLimiter {
    max_rate_per_second: f64,
    max_burst: i64,
    cache_ttl: Duration,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_rate_per_second", &self.max_rate_per_second)
            .field("max_burst", &self.max_burst)
            .field("cache_ttl", &self.cache_ttl)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// A negative or NaN rate is treated as zero.
    pub fn new(options: LimiterOptions) -> Self {
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let cache = options
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::with_clock(clock.clone())) as Arc<dyn Cache>);
        let cache_ttl = if options.cache_ttl.is_zero() {
            DEFAULT_CACHE_TTL
        } else {
            options.cache_ttl
        };

        Self {
            max_rate_per_second: options.max_rate_per_second.max(0.0),
            max_burst: i64::try_from(options.max_burst).unwrap_or(i64::MAX),
            cache_ttl,
            cache,
            clock,
        }
    }

    pub fn max_rate_per_second(&self) -> f64 {
        self.max_rate_per_second
    }

    pub fn max_burst(&self) -> i64 {
        self.max_burst
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Take one permit for `key` if one is available.
    pub async fn allow(&self, key: &str) -> bool {
        self.check(key).await.allowed
    }

    /// Permits currently available for `key`, without consuming one.
    pub async fn remaining(&self, key: &str) -> i64 {
        let state = self.refill(key).await;
        self.persist(key, state).await;
        state.bucket
    }

    /// Take one permit for `key` if available and report the bucket afterwards.
    pub async fn check(&self, key: &str) -> Verdict {
        let mut state = self.refill(key).await;

        let allowed = state.bucket > 0;
        if allowed {
            state.bucket -= 1;
        }
        self.persist(key, state).await;

        trace!(key = %key, allowed, remaining = state.bucket, "Checked rate limit");
        if !allowed {
            debug!(key = %key, "Rate limit exceeded");
        }

        Verdict::new(
            allowed,
            self.max_rate_per_second,
            state.bucket,
            self.reset_secs(),
        )
    }

    /// Time for an empty bucket to refill completely.
    ///
    /// `None` when the rate is zero and the bucket never refills.
    pub fn retry_after(&self) -> Option<Duration> {
        self.reset_secs().map(Duration::from_secs)
    }

    fn reset_secs(&self) -> Option<u64> {
        if self.max_rate_per_second > 0.0 {
            Some((self.max_burst as f64 / self.max_rate_per_second).floor() as u64)
        } else {
            None
        }
    }

    /// Bring the bucket for `key` up to date with the time elapsed since its
    /// last fill.
    ///
    /// A key with no stored fill time counts as last filled at the epoch, so
    /// any positive rate starts it full and a zero rate starts it empty.
    async fn refill(&self, key: &str) -> Refill {
        let now = self.clock.now_millis();

        let last_fill = match self.cache.get(&last_fill_key(key)).await {
            Ok(Some(last_fill)) => last_fill,
            Ok(None) => 0,
            Err(e) => self.last_fill_on_error(key, now, &e),
        };
        let elapsed_ms = now.saturating_sub(last_fill).max(0);
        let minted = self.tokens_for(elapsed_ms);

        let stored = match self.cache.get(&bucket_key(key)).await {
            Ok(Some(bucket)) => bucket.clamp(0, self.max_burst),
            Ok(None) => 0,
            Err(e) => self.bucket_on_error(key, &e),
        };

        let bucket = stored.saturating_add(minted).min(self.max_burst);

        // Only the time that paid for whole tokens is consumed, so calls
        // closer together than one token interval still accrue. A full
        // bucket holds no credit.
        //
        // The stored fill time can therefore trail `now` by up to one token
        // interval. Rounding the spent time up keeps sub-millisecond token
        // intervals from minting again at the same instant.
        let last_fill = if bucket == self.max_burst {
            now.max(last_fill)
        } else if minted == 0 {
            last_fill
        } else {
            let spent_ms = (minted as f64 * 1000.0 / self.max_rate_per_second).ceil() as i64;
            last_fill.saturating_add(spent_ms).min(now)
        };

        Refill { bucket, last_fill }
    }

    /// Whole tokens earned over `elapsed_ms`, capped at the burst size.
    fn tokens_for(&self, elapsed_ms: i64) -> i64 {
        let minted = (elapsed_ms as f64 * self.max_rate_per_second / 1000.0).floor();
        if minted >= self.max_burst as f64 {
            self.max_burst
        } else {
            minted as i64
        }
    }

    /// Fail-open substitute for an unreadable fill time.
    ///
    /// Returns `now`, so the elapsed interval is zero and nothing is minted.
    fn last_fill_on_error(&self, key: &str, now: i64, error: &CacheError) -> i64 {
        warn!(key = %key, error = %error, "Failed to read last fill time, assuming now");
        now
    }

    /// Fail-open substitute for an unreadable bucket: a full one.
    fn bucket_on_error(&self, key: &str, error: &CacheError) -> i64 {
        warn!(key = %key, error = %error, "Failed to read bucket, assuming full");
        self.max_burst
    }

    /// Best-effort write of the computed state; failures are only logged.
    async fn persist(&self, key: &str, state: Refill) {
        if let Err(e) = self
            .cache
            .set_with_expiration(&bucket_key(key), state.bucket, self.cache_ttl)
            .await
        {
            debug!(key = %key, error = %e, "Ignoring failed bucket write");
        }
        if let Err(e) = self
            .cache
            .set_with_expiration(&last_fill_key(key), state.last_fill, self.cache_ttl)
            .await
        {
            debug!(key = %key, error = %e, "Ignoring failed fill time write");
        }
    }
}
