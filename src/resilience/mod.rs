//! # Resilience Primitives Module
//!
//! Blocking building blocks for calling a rate-limited, paid API from many
//! worker threads without wasting calls.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry`] | Retry policies and the classifying retry driver |
//! | [`rate_limiter`] | Requests-per-minute pacing with jitter |
//! | [`token_window`] | Sliding 60 s tokens-per-minute budget |
//!
//! ## Retry
//!
//! Terminal errors (quota, authorization) and empty-result validation errors
//! are returned immediately; everything else follows the policy:
//!
//! ```rust
//! use llm_throttle::resilience::retry::{with_retry, ExponentialBackoff};
//! use llm_throttle::Error;
//! use std::time::Duration;
//!
//! let policy = ExponentialBackoff::new()
//!     .with_max_attempts(3)
//!     .with_base_delay(Duration::from_millis(1));
//! let mut calls = 0;
//! let value = with_retry(&policy, || {
//!     calls += 1;
//!     if calls < 2 {
//!         Err(Error::Remote { status: 503, message: "busy".into(), retryable: true })
//!     } else {
//!         Ok(42)
//!     }
//! });
//! assert_eq!(value.unwrap(), 42);
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use llm_throttle::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(6_000.0).unwrap()).unwrap();
//! limiter.wait(); // first slot is immediate
//! ```

pub mod rate_limiter;
pub mod retry;
pub mod token_window;

pub use rate_limiter::{rate_limited, RateLimited, RateLimiter, RateLimiterConfig};
pub use retry::{
    retrying, with_retry, ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy, Retrying,
};
pub use token_window::{TokenWindow, TokenWindowSnapshot};
