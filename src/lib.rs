//! Global Limiter - Distributed Sliding-Window Rate Limiting
//!
//! This crate lets many independent processes share one quota of "N
//! operations per T seconds". All window state lives in a shared store
//! (Redis in production) and every admission decision is one atomic
//! evaluation there, so the limit holds across process boundaries.
//!
//! ```no_run
//! use global_limiter::{GlobalLimiter, LimiterConfig};
//!
//! # async fn demo() -> global_limiter::Result<()> {
//! let config = LimiterConfig::new("binance_orders", 10, 1.0);
//! let limiter = GlobalLimiter::connect(&config).await?;
//!
//! let _permit = limiter.scoped().await?;
//! // call the rate-limited API here
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use crate::config::{LimiterConfig, RetryConfig};
pub use crate::error::{LimiterError, Result};
pub use crate::ratelimit::{Admission, GlobalLimiter, LimiterIdentity, Permit, SlidingWindowLimiter};
