//! Key-value storage the rate limiter keeps bucket state in.
//!
//! The limiter only ever talks to a [`Cache`], so the same algorithm can run
//! against an in-process map or a store shared between service instances.

mod memory;
mod mesh;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryCache;
pub use mesh::MeshCache;

/// Errors a cache backend can report.
///
/// A missing key is not an error; `get` returns `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not complete the operation.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The stored payload could not be decoded.
    #[error("Corrupt cache entry for {key}: {value:?}")]
    Corrupt { key: String, value: String },
}

/// Minimal integer cache contract.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the value stored for `key`.
    ///
    /// Returns `Ok(None)` when the key is absent or has expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError>;

    /// Store `value` for `key` without expiration.
    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError> {
        self.set_with_expiration(key, value, Duration::ZERO).await
    }

    /// Store `value` for `key`, unreadable once `ttl` has elapsed.
    ///
    /// A zero `ttl` means the value never expires.
    async fn set_with_expiration(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// Absolute expiry in epoch milliseconds, `None` for a zero TTL.
pub(crate) fn expiry_after(now_millis: i64, ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        return None;
    }
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    Some(now_millis.saturating_add(ttl_millis))
}
