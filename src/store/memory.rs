//! In-process window store.
//!
//! Emulates the Redis store for a single process: each key's window sits
//! behind its map entry lock, so an evaluation is atomic with respect to
//! every other caller sharing the same `MemoryWindowStore`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

use super::{EvaluateRequest, Evaluation, StoreError, WindowEntry, WindowStore};

/// Evaluations between sweeps for keys whose expiry has passed.
const SWEEP_EVERY: u64 = 256;

/// Entries of one key, oldest first.
#[derive(Debug, Default)]
struct KeyWindow {
    entries: Vec<WindowEntry>,
    /// Time after which the whole key is dropped, like a Redis PEXPIRE.
    expires_at: Option<u64>,
}

impl KeyWindow {
    fn is_expired(&self, now_millis: u64) -> bool {
        matches!(self.expires_at, Some(at) if at < now_millis)
    }

    fn expire_if_due(&mut self, now_millis: u64) {
        if self.is_expired(now_millis) {
            self.entries.clear();
            self.expires_at = None;
        }
    }

    fn prune(&mut self, threshold_millis: i64) -> u64 {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.timestamp_millis as i64 >= threshold_millis);
        (before - self.entries.len()) as u64
    }

    fn insert(&mut self, entry: WindowEntry) {
        self.entries.retain(|e| e.member != entry.member);
        let at = self
            .entries
            .partition_point(|e| e.timestamp_millis <= entry.timestamp_millis);
        self.entries.insert(at, entry);
    }
}

/// A window store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, KeyWindow>,
    offline: AtomicBool,
    failures_pending: AtomicU32,
    evaluations: AtomicU64,
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` operations with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop every key whose expiry is before `now_millis`. Returns how many
    /// keys were removed.
    ///
    /// Evaluations call this periodically, so keys nobody touches again do
    /// not accumulate.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now_millis));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired window keys");
        }
        removed
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store is offline".to_string()));
        }

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Connection("injected failure".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn evaluate(&self, request: &EvaluateRequest<'_>) -> Result<Evaluation, StoreError> {
        self.check_available()?;

        // Must run before taking the entry lock below.
        if self.evaluations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired(request.now_millis);
        }

        let mut window = self.windows.entry(request.key.to_string()).or_default();
        window.expire_if_due(request.now_millis);
        window.prune(request.threshold_millis());

        let current = window.entries.len() as u64;
        trace!(key = %request.key, current = current, amount = request.amount, "Evaluating window");

        if current + request.amount <= request.limit {
            for i in 1..=request.amount {
                window.insert(WindowEntry {
                    member: format!("{}{}", request.member_prefix, i),
                    timestamp_millis: request.now_millis,
                });
            }
            let expires_at = request.now_millis + request.window_millis;
            window.expires_at = Some(window.expires_at.map_or(expires_at, |at| at.max(expires_at)));

            Ok(Evaluation::Granted {
                remaining: request.limit - current - request.amount,
            })
        } else {
            Ok(Evaluation::Denied {
                oldest_millis: window.entries.first().map(|e| e.timestamp_millis),
            })
        }
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self
            .windows
            .get(key)
            .map(|w| w.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn leak(&self, key: &str, threshold_millis: i64) -> Result<u64, StoreError> {
        self.check_available()?;
        let removed = match self.windows.get_mut(key) {
            Some(mut window) => window.prune(threshold_millis),
            None => 0,
        };
        self.windows.remove_if(key, |_, window| window.entries.is_empty());

        debug!(key = %key, removed = removed, "Leaked expired window entries");
        Ok(removed)
    }

    async fn peek(&self, key: &str, index: usize) -> Result<Option<WindowEntry>, StoreError> {
        self.check_available()?;
        Ok(self
            .windows
            .get(key)
            .and_then(|w| w.entries.iter().rev().nth(index).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(now: u64, amount: u64) -> EvaluateRequest<'static> {
        EvaluateRequest {
            key: "test:key|3|10",
            now_millis: now,
            window_millis: 10_000,
            limit: 3,
            amount,
            member_prefix: "node|1|",
        }
    }

    #[tokio::test]
    async fn test_evaluate_grants_within_limit() {
        let store = MemoryWindowStore::new();

        let result = store.evaluate(&request(1_000, 2)).await.unwrap();
        assert_eq!(result, Evaluation::Granted { remaining: 1 });
        assert_eq!(store.count("test:key|3|10").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_evaluate_denies_and_reports_oldest() {
        let store = MemoryWindowStore::new();
        store
            .evaluate(&EvaluateRequest { member_prefix: "a|", ..request(1_000, 1) })
            .await
            .unwrap();
        store
            .evaluate(&EvaluateRequest { member_prefix: "b|", ..request(2_000, 2) })
            .await
            .unwrap();

        let result = store.evaluate(&request(3_000, 1)).await.unwrap();
        assert_eq!(result, Evaluation::Denied { oldest_millis: Some(1_000) });
        assert_eq!(store.count("test:key|3|10").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_entry_at_threshold_still_counts() {
        let store = MemoryWindowStore::new();
        store
            .evaluate(&EvaluateRequest { limit: 1, ..request(0, 1) })
            .await
            .unwrap();

        // now - window == 0, the entry is exactly on the edge
        let edge = EvaluateRequest { limit: 1, member_prefix: "b|", ..request(10_000, 1) };
        assert!(matches!(
            store.evaluate(&edge).await.unwrap(),
            Evaluation::Denied { .. }
        ));

        let after = EvaluateRequest { limit: 1, member_prefix: "c|", ..request(10_001, 1) };
        assert!(matches!(
            store.evaluate(&after).await.unwrap(),
            Evaluation::Granted { remaining: 0 }
        ));
    }

    #[tokio::test]
    async fn test_leak_and_peek() {
        let store = MemoryWindowStore::new();
        store
            .evaluate(&EvaluateRequest { member_prefix: "a|", ..request(1_000, 1) })
            .await
            .unwrap();
        store
            .evaluate(&EvaluateRequest { member_prefix: "b|", ..request(5_000, 1) })
            .await
            .unwrap();

        let newest = store.peek("test:key|3|10", 0).await.unwrap().unwrap();
        assert_eq!(newest.member, "b|1");
        assert_eq!(newest.timestamp_millis, 5_000);
        let oldest = store.peek("test:key|3|10", 1).await.unwrap().unwrap();
        assert_eq!(oldest.member, "a|1");
        assert!(store.peek("test:key|3|10", 2).await.unwrap().is_none());

        assert_eq!(store.leak("test:key|3|10", 2_000).await.unwrap(), 1);
        assert_eq!(store.count("test:key|3|10").await.unwrap(), 1);
        assert_eq!(store.leak("missing", 2_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_slides_past_old_entries() {
        let store = MemoryWindowStore::new();
        store.evaluate(&request(0, 3)).await.unwrap();

        let later = EvaluateRequest { member_prefix: "x|", ..request(10_001, 3) };
        assert_eq!(
            store.evaluate(&later).await.unwrap(),
            Evaluation::Granted { remaining: 0 }
        );
        assert_eq!(store.count("test:key|3|10").await.unwrap(), 3);
        assert_eq!(store.peek("test:key|3|10", 2).await.unwrap().unwrap().member, "x|1");
    }

    #[tokio::test]
    async fn test_leak_drops_emptied_key() {
        let store = MemoryWindowStore::new();
        store.evaluate(&request(1_000, 2)).await.unwrap();
        assert_eq!(store.key_count(), 1);

        assert_eq!(store.leak("test:key|3|10", 5_000).await.unwrap(), 2);
        assert_eq!(store.key_count(), 0);
        assert!(store.peek("test:key|3|10", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept() {
        let store = MemoryWindowStore::new();
        store.evaluate(&request(0, 1)).await.unwrap();
        assert_eq!(store.purge_expired(10_000), 0);

        // Only traffic on another key from here on.
        let other = EvaluateRequest { key: "test:other|3|10", ..request(20_000, 3) };
        for _ in 0..SWEEP_EVERY - 1 {
            store.evaluate(&other).await.unwrap();
        }

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.count("test:key|3|10").await.unwrap(), 0);
        assert_eq!(store.count("test:other|3|10").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryWindowStore::new();
        store.fail_next(2);

        assert!(store.count("k").await.is_err());
        assert!(store.count("k").await.is_err());
        assert!(store.count("k").await.is_ok());

        store.set_offline(true);
        assert!(matches!(
            store.evaluate(&request(0, 1)).await,
            Err(StoreError::Connection(_))
        ));
        store.set_offline(false);
        assert!(store.evaluate(&request(0, 1)).await.is_ok());
    }
}
