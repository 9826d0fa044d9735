//! Window store abstraction.
//!
//! The store holds every window entry; limiters hold none. All mutation of
//! a window goes through [`WindowStore::evaluate`], which must prune, count
//! and record as one indivisible step visible to every client of the store.

mod memory;
mod redis_store;

pub use memory::MemoryWindowStore;
pub use redis_store::RedisWindowStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a window store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

/// One atomic evaluate-and-record request.
#[derive(Debug, Clone, Copy)]
pub struct EvaluateRequest<'a> {
    /// Derived store key of the limiter identity.
    pub key: &'a str,
    /// Caller's current time in milliseconds.
    pub now_millis: u64,
    /// Window length in milliseconds.
    pub window_millis: u64,
    /// Maximum entries allowed inside the window.
    pub limit: u64,
    /// Entries to record on success.
    pub amount: u64,
    /// Member name prefix; entry `i` (1-based) is stored as `{prefix}{i}`.
    pub member_prefix: &'a str,
}

impl EvaluateRequest<'_> {
    /// Entries scored below this are outside the window.
    pub fn threshold_millis(&self) -> i64 {
        self.now_millis as i64 - self.window_millis as i64
    }
}

/// Outcome of an atomic evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Entries were recorded; `remaining` permits are left in the window.
    Granted { remaining: u64 },
    /// Nothing was recorded. `oldest_millis` is the oldest entry still
    /// inside the window, if any.
    Denied { oldest_millis: Option<u64> },
}

/// A stored window entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    pub member: String,
    pub timestamp_millis: u64,
}

/// Capability contract of the shared window store.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically prune expired entries, count the rest and record
    /// `amount` new entries if they fit under the limit.
    async fn evaluate(&self, request: &EvaluateRequest<'_>) -> Result<Evaluation, StoreError>;

    /// Number of stored entries under `key`, expired or not.
    async fn count(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove entries scored below `threshold_millis`. Returns how many were removed.
    async fn leak(&self, key: &str, threshold_millis: i64) -> Result<u64, StoreError>;

    /// The `index`-th newest entry under `key`.
    async fn peek(&self, key: &str, index: usize) -> Result<Option<WindowEntry>, StoreError>;
}
