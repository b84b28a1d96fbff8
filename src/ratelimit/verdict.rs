//! Decision metadata handed to transport layers.

use serde::{Deserialize, Serialize};

/// Outcome of a single admission check.
///
/// Besides the decision itself this carries what a transport usually
/// reports back to the client: the configured rate, the permits left, and
/// how long a drained bucket takes to refill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether a permit was granted
    pub allowed: bool,
    /// Sustained permits per second
    pub limit: f64,
    /// Permits left after this check
    pub remaining: i64,
    /// Seconds for an empty bucket to refill, `None` when the rate is zero
    pub reset_secs: Option<u64>,
    /// Seconds the client should wait, only set on denial
    pub retry_after_secs: Option<u64>,
}

impl Verdict {
    pub(crate) fn new(allowed: bool, limit: f64, remaining: i64, reset_secs: Option<u64>) -> Self {
        Self {
            allowed,
            limit,
            remaining,
            reset_secs,
            retry_after_secs: if allowed { None } else { reset_secs },
        }
    }
}
