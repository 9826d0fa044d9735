//! Sliding-window rate limiting on top of a shared window store.

mod backoff;
mod clock;
mod identity;
mod limiter;
mod scheduler;

pub use backoff::ExponentialBackoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::LimiterIdentity;
pub use limiter::{Admission, SlidingWindowLimiter};
pub use scheduler::{GlobalLimiter, Permit};
