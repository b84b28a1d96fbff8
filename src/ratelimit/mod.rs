//! Token-bucket rate limiting over a pluggable cache.

mod limiter;
mod verdict;

pub use limiter::{LimiterOptions, RateLimiter, DEFAULT_CACHE_TTL};
pub use verdict::Verdict;
