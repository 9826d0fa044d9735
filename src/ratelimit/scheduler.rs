//! Waiting for capacity.
//!
//! [`GlobalLimiter`] turns "I need N permits" into a series of admission
//! checks separated by waits. The wait after a denial is exactly the
//! interval the window advises, so callers never poll the store faster than
//! capacity can free up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{LimiterConfig, RetryConfig};
use crate::error::{LimiterError, Result};
use crate::store::{RedisWindowStore, WindowEntry, WindowStore};

use super::backoff::ExponentialBackoff;
use super::clock::{Clock, SystemClock};
use super::limiter::{Admission, SlidingWindowLimiter};

/// Added to every advised wait so the retry lands strictly after the
/// oldest entry has left the window.
const RETRY_TICK: Duration = Duration::from_millis(1);

/// A process-local handle on a shared quota.
///
/// Cheap to share behind an `Arc`; any number of tasks may call
/// [`acquire`](Self::acquire) concurrently.
#[derive(Debug)]
pub struct GlobalLimiter {
    core: SlidingWindowLimiter,
    retry: RetryConfig,
}

impl GlobalLimiter {
    /// Wrap a limiter core with the default retry policy.
    pub fn new(core: SlidingWindowLimiter) -> Self {
        Self::with_retry(core, RetryConfig::default())
    }

    /// Wrap a limiter core with an explicit retry policy.
    pub fn with_retry(core: SlidingWindowLimiter, retry: RetryConfig) -> Self {
        Self { core, retry }
    }

    /// Build a limiter from configuration on top of an existing store.
    pub fn from_config(
        config: &LimiterConfig,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let core = SlidingWindowLimiter::with_clock(config.identity()?, store, clock);
        Ok(Self::with_retry(core, config.retry.clone()))
    }

    /// Connect to the Redis store named in `config` and build a limiter on
    /// the wall clock.
    ///
    /// Each call opens its own connection. Processes running several
    /// limiters against one server should connect a single
    /// [`RedisWindowStore`] and hand clones of it to
    /// [`from_config`](Self::from_config).
    pub async fn connect(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        let store =
            RedisWindowStore::connect(&config.redis_url, config.retry.operation_timeout()).await?;
        let limiter = Self::from_config(config, Arc::new(store), Arc::new(SystemClock))?;

        info!(key = %limiter.core.store_key(), "Global limiter ready");
        Ok(limiter)
    }

    pub fn core(&self) -> &SlidingWindowLimiter {
        &self.core
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Wait until `amount` permits are granted.
    ///
    /// With a `timeout`, gives up with [`LimiterError::Timeout`] once the
    /// clock says it has passed, or as soon as the next advised wait would
    /// take it past, without probing the store again. A store call that
    /// hangs is cut off at the deadline too.
    pub async fn acquire(&self, amount: u64, timeout: Option<Duration>) -> Result<()> {
        self.acquire_until(amount, timeout, std::future::pending()).await
    }

    /// Like [`acquire`](Self::acquire), but gives up as soon as `cancel`
    /// completes, returning [`LimiterError::Cancelled`].
    ///
    /// Permits are only consumed when granted, so cancelling a wait never
    /// leaves anything behind in the store. Cancelling while a store call is
    /// in flight abandons the call; if the store had already recorded the
    /// grant, those permits stay consumed until they leave the window.
    /// Dropping the returned future behaves the same way.
    pub async fn acquire_until<F>(
        &self,
        amount: u64,
        timeout: Option<Duration>,
        cancel: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.core.validate_amount(amount)?;
        tokio::pin!(cancel);

        let key = self.core.store_key();
        let clock = self.core.clock();
        let started = clock.now_millis();
        let operation_timeout = self.retry.operation_timeout();
        let max_failures = self.retry.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::from(&self.retry);
        let mut failures: u32 = 0;
        let mut last_error: Option<LimiterError> = None;

        loop {
            let remaining = timeout.map(|limit| limit.saturating_sub(self.elapsed_since(started)));
            let bound = remaining.map_or(operation_timeout, |r| r.min(operation_timeout));

            let attempt = tokio::select! {
                biased;
                result = self.core.try_acquire(amount) => Some(result),
                _ = &mut cancel => {
                    debug!(key = %key, amount = amount, "Acquire cancelled");
                    return Err(LimiterError::Cancelled);
                }
                _ = clock.sleep(bound) => None,
            };

            let attempt = match attempt {
                Some(result) => result,
                None if remaining.map_or(false, |r| r <= operation_timeout) => {
                    let waited = self.elapsed_since(started);
                    debug!(
                        key = %key,
                        amount = amount,
                        waited_ms = waited.as_millis() as u64,
                        "Acquire deadline reached during store call"
                    );
                    return Err(last_error.unwrap_or(LimiterError::Timeout { waited }));
                }
                None => Err(LimiterError::StoreUnavailable(format!(
                    "no reply within {} ms",
                    bound.as_millis()
                ))),
            };

            let wait = match attempt {
                Ok(Admission::Granted { remaining }) => {
                    debug!(
                        key = %key,
                        amount = amount,
                        remaining = remaining,
                        waited_ms = self.elapsed_since(started).as_millis() as u64,
                        "Permits acquired"
                    );
                    return Ok(());
                }
                Ok(Admission::Denied { retry_after }) => {
                    failures = 0;
                    backoff.reset();
                    last_error = None;
                    retry_after + RETRY_TICK
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if failures >= max_failures {
                        warn!(
                            key = %key,
                            failures = failures,
                            error = %err,
                            "Window store unavailable, giving up"
                        );
                        return Err(err);
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        key = %key,
                        failures = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Window store unavailable, retrying"
                    );
                    last_error = Some(err);
                    delay
                }
                Err(err) => return Err(err),
            };

            if let Some(limit) = timeout {
                let waited = self.elapsed_since(started);
                if waited + wait > limit {
                    debug!(
                        key = %key,
                        amount = amount,
                        waited_ms = waited.as_millis() as u64,
                        "Acquire deadline reached"
                    );
                    return Err(last_error.unwrap_or(LimiterError::Timeout { waited }));
                }
            }

            trace!(key = %key, wait_ms = wait.as_millis() as u64, "Waiting for capacity");

            tokio::select! {
                biased;
                _ = &mut cancel => {
                    debug!(key = %key, amount = amount, "Acquire cancelled");
                    return Err(LimiterError::Cancelled);
                }
                _ = clock.sleep(wait) => {}
            }
        }
    }

    fn elapsed_since(&self, started_millis: u64) -> Duration {
        Duration::from_millis(self.core.clock().now_millis().saturating_sub(started_millis))
    }

    /// Wait for `amount` permits and hand back a guard for the gated section.
    pub async fn scoped_acquire(&self, amount: u64) -> Result<Permit<'_>> {
        self.acquire(amount, None).await?;
        Ok(Permit {
            limiter: self,
            amount,
            granted_at_millis: self.core.clock().now_millis(),
        })
    }

    /// Wait for a single permit. Same as `scoped_acquire(1)`.
    pub async fn scoped(&self) -> Result<Permit<'_>> {
        self.scoped_acquire(1).await
    }

    /// Acquire `amount` permits, then run `section` while holding them.
    pub async fn run<F>(&self, amount: u64, section: F) -> Result<F::Output>
    where
        F: Future,
    {
        let _permit = self.scoped_acquire(amount).await?;
        Ok(section.await)
    }

    /// See [`SlidingWindowLimiter::count`].
    pub async fn count(&self) -> Result<u64> {
        self.core.count().await
    }

    /// See [`SlidingWindowLimiter::leak`].
    pub async fn leak(&self) -> Result<u64> {
        self.core.leak().await
    }

    /// See [`SlidingWindowLimiter::peek`].
    pub async fn peek(&self, index: usize) -> Result<Option<WindowEntry>> {
        self.core.peek(index).await
    }
}

/// Proof that permits were granted.
///
/// Dropping it does nothing to the store: granted permits stay consumed
/// until they slide out of the window.
#[derive(Debug)]
#[must_use = "the permit marks the gated section; bind it to a variable"]
pub struct Permit<'a> {
    limiter: &'a GlobalLimiter,
    amount: u64,
    granted_at_millis: u64,
}

impl Permit<'_> {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Clock reading right after the grant, in milliseconds.
    pub fn granted_at_millis(&self) -> u64 {
        self.granted_at_millis
    }

    pub fn limiter(&self) -> &GlobalLimiter {
        self.limiter
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        trace!(
            key = %self.limiter.core.store_key(),
            amount = self.amount,
            "Leaving gated section"
        );
    }
}
