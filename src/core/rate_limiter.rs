//! Fixed-window attempt counting.
//!
//! [`RateLimiter`] is the service the gate, the API guard and the login
//! handler share. It counts through a [`RateLimitStore`] (in-process map or a
//! shared REST counter) and never fails: when the shared store is unreachable
//! it logs and falls back to its local memory store, trading cross-instance
//! accuracy for availability.
use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scc::{HashMap, hash_map::Entry};

pub use crate::ports::rate_limit_store::RateLimitDecision;
use crate::ports::rate_limit_store::{RateLimitStore, StoreResult};

/// One identifier's counter for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateWindow {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero()),
        }
    }

    fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }

    /// Apply one attempt and report the decision.
    fn record(&mut self, max_attempts: u32) -> RateLimitDecision {
        if self.count >= max_attempts {
            return RateLimitDecision {
                allowed: false,
                limit: max_attempts,
                remaining: 0,
                reset_at: self.reset_at,
            };
        }

        self.count += 1;
        RateLimitDecision {
            allowed: true,
            limit: max_attempts,
            remaining: max_attempts - self.count,
            reset_at: self.reset_at,
        }
    }
}

/// In-process store on a concurrent map.
///
/// Expired windows are swept lazily during `hit`, at most once per sweep
/// interval, so no background task is needed.
pub struct MemoryRateLimitStore {
    windows: HashMap<String, RateWindow>,
    sweep_interval: Duration,
    last_sweep_ms: AtomicI64,
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MemoryRateLimitStore {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            sweep_interval,
            last_sweep_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Number of tracked identifiers, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Current window for `key`, if any.
    pub async fn window(&self, key: &str) -> Option<RateWindow> {
        self.windows
            .get_async(&key.to_string())
            .await
            .map(|entry| *entry.get())
    }

    async fn sweep_if_due(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last < self.sweep_interval.as_millis() as i64 {
            return;
        }
        // only one caller wins the right to sweep
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.windows.len();
        self.windows
            .retain_async(|_, window| !window.is_elapsed(now))
            .await;
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Swept expired rate limit windows");
        }
    }

    /// Force a sweep regardless of the interval.
    pub async fn sweep(&self) {
        let now = Utc::now();
        self.last_sweep_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.windows
            .retain_async(|_, window| !window.is_elapsed(now))
            .await;
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        max_attempts: u32,
        window: Duration,
    ) -> StoreResult<RateLimitDecision> {
        let now = Utc::now();
        self.sweep_if_due(now).await;

        // The entry lock makes read-increment atomic per key.
        let decision = match self.windows.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_elapsed(now) {
                    *current = RateWindow::fresh(now, window);
                }
                current.record(max_attempts)
            }
            Entry::Vacant(vacant) => {
                let mut fresh = RateWindow::fresh(now, window);
                let decision = fresh.record(max_attempts);
                vacant.insert_entry(fresh);
                decision
            }
        };

        Ok(decision)
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.windows.remove_async(&key.to_string()).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Shared attempt counter used by every pipeline stage.
#[derive(Clone)]
pub struct RateLimiter {
    primary: Arc<dyn RateLimitStore>,
    fallback: Arc<MemoryRateLimitStore>,
    // primary and fallback are the same map
    local_only: bool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.primary.name())
            .field("fallback_entries", &self.fallback.len())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::in_memory(Duration::from_secs(60))
    }
}

impl RateLimiter {
    /// Limiter backed only by the process-local map.
    pub fn in_memory(sweep_interval: Duration) -> Self {
        let memory = Arc::new(MemoryRateLimitStore::new(sweep_interval));
        Self {
            primary: memory.clone(),
            fallback: memory,
            local_only: true,
        }
    }

    /// Limiter backed by a shared store, degrading to memory on store errors.
    pub fn with_store(store: Arc<dyn RateLimitStore>, sweep_interval: Duration) -> Self {
        Self {
            primary: store,
            fallback: Arc::new(MemoryRateLimitStore::new(sweep_interval)),
            local_only: false,
        }
    }

    /// Name of the primary backend
    pub fn store_name(&self) -> &'static str {
        self.primary.name()
    }

    /// Count one attempt for `identifier`. Never fails.
    pub async fn check(
        &self,
        identifier: &str,
        max_attempts: u32,
        window: Duration,
    ) -> RateLimitDecision {
        match self.primary.hit(identifier, max_attempts, window).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    store = self.primary.name(),
                    identifier,
                    error = %e,
                    "Rate limit store unavailable, falling back to local memory"
                );
                self.fallback
                    .hit(identifier, max_attempts, window)
                    .await
                    .unwrap_or(RateLimitDecision {
                        allowed: true,
                        limit: max_attempts,
                        remaining: max_attempts.saturating_sub(1),
                        reset_at: Utc::now(),
                    })
            }
        }
    }

    /// Forget the counter for `identifier` in every backend.
    pub async fn reset(&self, identifier: &str) {
        if let Err(e) = self.primary.reset(identifier).await {
            tracing::warn!(
                store = self.primary.name(),
                identifier,
                error = %e,
                "Failed to reset rate limit record"
            );
        }
        if !self.local_only {
            let _ = self.fallback.reset(identifier).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::ports::rate_limit_store::StoreError;

    const WINDOW: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_allows_up_to_max_then_refuses() {
        let limiter = RateLimiter::default();

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check("login:1.2.3.4:root", 5, WINDOW).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
        }

        let refused = limiter.check("login:1.2.3.4:root", 5, WINDOW).await;
        assert!(!refused.allowed);
        assert_eq!(refused.remaining, 0);
        assert!(refused.retry_after_secs() >= 1);
    }

    #[tokio::test]
    async fn test_refusal_does_not_increment() {
        let store = MemoryRateLimitStore::default();
        store.hit("k", 1, WINDOW).await.unwrap();
        store.hit("k", 1, WINDOW).await.unwrap();
        store.hit("k", 1, WINDOW).await.unwrap();
        assert_eq!(store.window("k").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = RateLimiter::default();
        assert!(limiter.check("api:a", 1, WINDOW).await.allowed);
        assert!(!limiter.check("api:a", 1, WINDOW).await.allowed);
        assert!(limiter.check("api:b", 1, WINDOW).await.allowed);
    }

    #[tokio::test]
    async fn test_window_elapses() {
        let limiter = RateLimiter::default();
        let window = Duration::from_millis(50);
        assert!(limiter.check("k", 1, window).await.allowed);
        assert!(!limiter.check("k", 1, window).await.allowed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let decision = limiter.check("k", 1, window).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_forgets_identifier() {
        let limiter = RateLimiter::default();
        assert!(limiter.check("login:x", 1, WINDOW).await.allowed);
        assert!(!limiter.check("login:x", 1, WINDOW).await.allowed);
        limiter.reset("login:x").await;
        assert!(limiter.check("login:x", 1, WINDOW).await.allowed);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let store = MemoryRateLimitStore::new(Duration::from_secs(3600));
        store.hit("old", 5, Duration::from_millis(10)).await.unwrap();
        store.hit("live", 5, WINDOW).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.sweep().await;
        assert!(store.window("old").await.is_none());
        assert!(store.window("live").await.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_never_exceed_max() {
        let limiter = RateLimiter::default();
        let allowed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let allowed = allowed.clone();
            handles.push(tokio::spawn(async move {
                if limiter.check("api:burst", 10, WINDOW).await.allowed {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 10);
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn hit(&self, _: &str, _: u32, _: Duration) -> StoreResult<RateLimitDecision> {
            Err(StoreError::Connection("refused".to_string()))
        }

        async fn reset(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Connection("refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_memory() {
        let limiter = RateLimiter::with_store(Arc::new(BrokenStore), Duration::from_secs(60));
        assert_eq!(limiter.store_name(), "broken");
        assert!(limiter.check("api:z", 2, WINDOW).await.allowed);
        assert!(limiter.check("api:z", 2, WINDOW).await.allowed);
        assert!(!limiter.check("api:z", 2, WINDOW).await.allowed);
        limiter.reset("api:z").await;
        assert!(limiter.check("api:z", 2, WINDOW).await.allowed);
    }
}
