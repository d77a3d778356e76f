//! Retry policies and the retry driver.
//!
//! Attempts are 1-indexed throughout: `get_delay(1)` is the pause taken after
//! the first failure, before the second attempt.

use crate::error::Classify;
use rand::Rng;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Decides how many attempts a call gets and how long to pause between them.
pub trait RetryPolicy: Send + Sync {
    fn max_attempts(&self) -> u32;

    /// Whether another attempt may follow failed attempt number `attempt`.
    fn should_retry(&self, attempt: u32, error: &dyn Classify) -> bool {
        let _ = error;
        attempt < self.max_attempts()
    }

    fn get_delay(&self, attempt: u32) -> Duration;
}

/// `delay = min(base_delay * multiplier^(attempt-1), max_delay)`, optionally
/// scaled by a uniform jitter factor.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Multiplicative jitter range applied after capping, e.g. `(0.75, 1.25)`.
    pub jitter: Option<(f64, f64)>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: None,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, low: f64, high: f64) -> Self {
        self.jitter = Some((low, high));
        self
    }

    /// Capped delay without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn get_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        match self.jitter {
            Some((low, high)) if high > low => {
                let factor = rand::thread_rng().gen_range(low..high).max(0.0);
                // saturate instead of overflowing near Duration::MAX
                Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
            }
            _ => delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn get_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Single attempt, never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn max_attempts(&self) -> u32 {
        1
    }

    fn should_retry(&self, _attempt: u32, _error: &dyn Classify) -> bool {
        false
    }

    fn get_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Runs `op` until it succeeds or the policy gives up.
///
/// Quota/authorization failures and empty-result validation failures are
/// returned on first sight without consuming retry budget. Every other error
/// is handed to the policy. When the policy is exhausted the last error is
/// returned unchanged.
pub fn with_retry<T, E, F>(policy: &dyn RetryPolicy, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> std::result::Result<T, E>,
    E: Classify + Display,
{
    let mut attempt: u32 = 1;
    loop {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempts = attempt, "call recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let class = err.class();
                if class.is_terminal() {
                    error!(class = %class, error = %err, "terminal error, not retrying");
                    return Err(err);
                }
                if matches!(class, crate::error::ErrorClass::ValidationEmpty) {
                    debug!(error = %err, "empty result, not retrying");
                    return Err(err);
                }
                if !policy.should_retry(attempt, &err) {
                    warn!(attempts = attempt, class = %class, error = %err, "giving up");
                    return Err(err);
                }

                let mut delay = policy.get_delay(attempt);
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint);
                }
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// A callable bound to a retry policy.
pub struct Retrying<F> {
    policy: Arc<dyn RetryPolicy>,
    inner: F,
}

impl<F> Retrying<F> {
    pub fn new(policy: Arc<dyn RetryPolicy>, inner: F) -> Self {
        Self { policy, inner }
    }

    pub fn call<A, T, E>(&self, arg: &A) -> std::result::Result<T, E>
    where
        A: ?Sized,
        F: Fn(&A) -> std::result::Result<T, E>,
        E: Classify + Display,
    {
        with_retry(self.policy.as_ref(), || (self.inner)(arg))
    }
}

pub fn retrying<F>(policy: Arc<dyn RetryPolicy>, inner: F) -> Retrying<F> {
    Retrying::new(policy, inner)
}
