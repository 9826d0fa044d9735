//! Limiter identity and store key derivation.

use std::time::Duration;

/// The composite key that identifies one shared quota.
///
/// Two limiters with equal identities enforce the same quota, whatever
/// process or host they run in. Changing any field yields a disjoint quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterIdentity {
    /// Namespace for the store key
    prefix: String,
    /// Name of the limited resource
    key: String,
    /// Maximum permits per window
    max_rate: u64,
    /// Sliding window length
    time_period: Duration,
}

impl LimiterIdentity {
    /// Create a new identity.
    pub fn new(prefix: &str, key: &str, max_rate: u64, time_period: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
            max_rate,
            time_period,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_rate(&self) -> u64 {
        self.max_rate
    }

    pub fn time_period(&self) -> Duration {
        self.time_period
    }

    /// Window length in store score units (milliseconds).
    pub fn window_millis(&self) -> u64 {
        self.time_period.as_millis() as u64
    }

    /// Derive the store key.
    ///
    /// Format: `"{prefix}:{key}|{max_rate}|{time_period_secs}"`, where whole
    /// seconds render without a fractional part (`60`, `2.5`).
    pub fn store_key(&self) -> String {
        format!(
            "{}:{}|{}|{}",
            self.prefix,
            self.key,
            self.max_rate,
            self.time_period.as_secs_f64()
        )
    }
}

impl std::fmt::Display for LimiterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.store_key())
    }
}
