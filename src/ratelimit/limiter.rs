//! Sliding-window admission control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{LimiterError, Result};
use crate::store::{EvaluateRequest, Evaluation, WindowEntry, WindowStore};

use super::clock::{Clock, SystemClock};
use super::identity::LimiterIdentity;

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The permits were recorded in the window.
    Granted { remaining: u64 },
    /// Not enough capacity; the oldest counted entry leaves the window
    /// after `retry_after`.
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

/// Admission control against a shared sliding window.
///
/// Holds no window state of its own. Every [`try_acquire`](Self::try_acquire)
/// is one atomic evaluation in the store, so any number of instances with
/// the same identity, in any number of processes, enforce one quota.
pub struct SlidingWindowLimiter {
    identity: LimiterIdentity,
    store_key: String,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    /// Unique per instance so entry names never collide across processes.
    instance_id: String,
    request_seq: AtomicU64,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("store_key", &self.store_key)
            .field("instance_id", &self.instance_id)
            .field("clock", &self.clock)
            .finish()
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter on the wall clock.
    pub fn new(identity: LimiterIdentity, store: Arc<dyn WindowStore>) -> Self {
        Self::with_clock(identity, store, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(
        identity: LimiterIdentity,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store_key = identity.store_key();
        Self {
            identity,
            store_key,
            store,
            clock,
            instance_id: uuid::Uuid::new_v4().to_string(),
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &LimiterIdentity {
        &self.identity
    }

    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check that `amount` could ever be granted by this limiter.
    pub fn validate_amount(&self, amount: u64) -> Result<()> {
        let max_rate = self.identity.max_rate();
        if amount == 0 || amount > max_rate {
            return Err(LimiterError::InvalidAmount { amount, max_rate });
        }
        Ok(())
    }

    /// Try to take `amount` permits right now.
    ///
    /// Never waits. Performs exactly one store round-trip unless the amount
    /// is invalid, in which case the store is not contacted at all.
    pub async fn try_acquire(&self, amount: u64) -> Result<Admission> {
        self.validate_amount(amount)?;

        let now = self.clock.now_millis();
        let window = self.identity.window_millis();
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let member_prefix = format!("{}|{}|", self.instance_id, seq);

        let request = EvaluateRequest {
            key: &self.store_key,
            now_millis: now,
            window_millis: window,
            limit: self.identity.max_rate(),
            amount,
            member_prefix: &member_prefix,
        };

        trace!(key = %self.store_key, amount = amount, now = now, "Evaluating sliding window");

        match self.store.evaluate(&request).await? {
            Evaluation::Granted { remaining } => {
                trace!(key = %self.store_key, amount = amount, remaining = remaining, "Permits granted");
                Ok(Admission::Granted { remaining })
            }
            Evaluation::Denied { oldest_millis } => {
                let retry_after = oldest_millis
                    .map(|oldest| (oldest + window).saturating_sub(now))
                    .unwrap_or(0);

                debug!(
                    key = %self.store_key,
                    amount = amount,
                    retry_after_ms = retry_after,
                    "Sliding window full"
                );

                Ok(Admission::Denied {
                    retry_after: Duration::from_millis(retry_after),
                })
            }
        }
    }

    /// Number of stored entries, including expired ones not yet pruned.
    pub async fn count(&self) -> Result<u64> {
        Ok(self.store.count(&self.store_key).await?)
    }

    /// Prune entries that have left the window. Returns how many were removed.
    pub async fn leak(&self) -> Result<u64> {
        let threshold = self.clock.now_millis() as i64 - self.identity.window_millis() as i64;
        Ok(self.store.leak(&self.store_key, threshold).await?)
    }

    /// The `index`-th newest entry, if there is one.
    pub async fn peek(&self, index: usize) -> Result<Option<WindowEntry>> {
        Ok(self.store.peek(&self.store_key, index).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryWindowStore;

    fn limiter(
        max_rate: u64,
        period: Duration,
        store: Arc<MemoryWindowStore>,
        clock: &ManualClock,
    ) -> SlidingWindowLimiter {
        let identity = LimiterIdentity::new("test", "exchange", max_rate, period);
        SlidingWindowLimiter::with_clock(identity, store, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_zero_and_oversized_amounts_are_invalid() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(0);
        let limiter = limiter(3, Duration::from_secs(1), store.clone(), &clock);

        assert!(matches!(
            limiter.try_acquire(0).await,
            Err(LimiterError::InvalidAmount { amount: 0, max_rate: 3 })
        ));
        assert!(matches!(
            limiter.try_acquire(4).await,
            Err(LimiterError::InvalidAmount { amount: 4, max_rate: 3 })
        ));
        // The store was never touched.
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_grant_then_deny_with_retry_after() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(1_000);
        let limiter = limiter(2, Duration::from_secs(10), store, &clock);

        assert_eq!(limiter.try_acquire(2).await.unwrap(), Admission::Granted { remaining: 0 });

        clock.advance(Duration::from_millis(2_500));
        assert_eq!(
            limiter.try_acquire(1).await.unwrap(),
            Admission::Denied { retry_after: Duration::from_millis(7_500) }
        );
    }

    #[tokio::test]
    async fn test_multi_permit_entries_are_counted_individually() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(0);
        let limiter = limiter(5, Duration::from_secs(1), store, &clock);

        assert!(limiter.try_acquire(3).await.unwrap().is_granted());
        assert_eq!(limiter.count().await.unwrap(), 3);
        assert!(!limiter.try_acquire(3).await.unwrap().is_granted());
        assert!(limiter.try_acquire(2).await.unwrap().is_granted());
        assert_eq!(limiter.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_member_names_carry_instance_and_sequence() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(0);
        let limiter = limiter(5, Duration::from_secs(1), store, &clock);

        limiter.try_acquire(2).await.unwrap();
        let newest = limiter.peek(0).await.unwrap().unwrap();
        assert!(newest.member.starts_with(limiter.instance_id()));
        assert!(newest.member.ends_with("|1|1") || newest.member.ends_with("|1|2"));
        assert_eq!(newest.timestamp_millis, 0);
    }

    #[tokio::test]
    async fn test_leak_removes_only_expired_entries() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(0);
        let limiter = limiter(5, Duration::from_secs(1), store, &clock);

        limiter.try_acquire(1).await.unwrap();
        clock.advance(Duration::from_millis(600));
        limiter.try_acquire(1).await.unwrap();
        clock.advance(Duration::from_millis(500));

        assert_eq!(limiter.leak().await.unwrap(), 1);
        assert_eq!(limiter.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(0);
        let limiter = limiter(1, Duration::from_secs(1), store.clone(), &clock);

        store.set_offline(true);
        assert!(matches!(
            limiter.try_acquire(1).await,
            Err(LimiterError::StoreUnavailable(_))
        ));
    }
}
