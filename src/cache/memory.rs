//! In-process cache with lazy expiration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{expiry_after, Cache, CacheError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    /// Epoch milliseconds at which the entry stops being readable.
    expires_at: Option<i64>,
}

/// A cache held in process memory.
///
/// Every operation serializes on a single lock. Expired entries are evicted
/// when they are next read; there is no background sweeper.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Create an empty cache on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty cache that reads expiry time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match entries.get(key).copied() {
            Some(entry) if entry.expires_at.is_some_and(|at| at <= now) => {
                trace!(key = %key, "Evicting expired entry");
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set_with_expiration(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = expiry_after(self.clock.now_millis(), ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}
