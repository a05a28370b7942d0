//! Reflex work queue: coalesces change notifications into "this key needs
//! attention" signals, keeps each key on at most one worker, and redelivers
//! failed keys after a policy-chosen delay.

#![forbid(unsafe_code)]

mod queue;
pub mod rate_limit;

pub use queue::{Checkout, QueueKey, WorkQueue};
pub use rate_limit::{default_controller_rate_limiter, ExponentialBackoff, MaxOf, RateLimiter, TokenBucket};
