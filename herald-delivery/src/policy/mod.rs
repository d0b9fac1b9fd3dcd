//! Delivery policies, kept apart from the worker loop so they can be tested
//! as plain functions.
//!
//! - [`RetryPolicy`]: whether and when a transient failure is retried
//! - [`DomainPolicyResolver`]: per-domain adjustments on top of it

pub mod domain;
pub mod retry;

pub use domain::{DomainPolicyResolver, DomainThrottle, DomainThrottleRegistry, EffectivePolicy};
pub use retry::{RetryDecision, RetryPolicy, calculate_backoff};
