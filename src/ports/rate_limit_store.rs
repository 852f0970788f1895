use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Custom error type for rate limit store operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store answered with a non-success status
    #[error("Store returned error status {status}: {message}")]
    Status { status: u16, message: String },

    /// The store answered with something we could not interpret
    #[error("Unexpected store response: {0}")]
    Protocol(String),
}

/// Result type alias for rate limit store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Maximum requests per window
    pub limit: u32,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds a refused caller should wait, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = (self.reset_at - Utc::now()).num_seconds();
        secs.max(1) as u64
    }

    /// Window reset as a Unix timestamp (seconds).
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// RateLimitStore is the port for fixed-window attempt counters.
///
/// `hit` must be atomic per key: two concurrent hits for the same identifier
/// may never both observe the same count.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Count one attempt for `key` against `max_attempts` per `window`.
    async fn hit(&self, key: &str, max_attempts: u32, window: Duration)
    -> StoreResult<RateLimitDecision>;

    /// Forget any record for `key`.
    async fn reset(&self, key: &str) -> StoreResult<()>;

    /// Short backend name used in logs
    fn name(&self) -> &'static str;
}
