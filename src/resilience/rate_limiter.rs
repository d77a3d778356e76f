use crate::error::{Error, ErrorContext};
use crate::Result;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub requests_per_minute: f64,
    pub min_interval: Duration,
    pub jitter: Duration,
    /// Estimated wait time until the next slot opens (ms), if one is pending.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests per minute.
    pub requests_per_minute: f64,
    /// Upper bound of the uniform jitter added to every interval.
    pub jitter: Duration,
}

impl RateLimiterConfig {
    pub fn from_rpm(rpm: f64) -> Option<Self> {
        let cfg = Self {
            requests_per_minute: rpm,
            jitter: Duration::ZERO,
        };
        cfg.try_min_interval().map(|_| cfg)
    }

    /// Create a new config with default values (20 rpm, 250ms jitter)
    pub fn new() -> Self {
        Self {
            requests_per_minute: 20.0,
            jitter: Duration::from_millis(250),
        }
    }

    pub fn with_requests_per_minute(mut self, rpm: f64) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// `60 / rpm`, or `None` when the rate is not positive or the interval
    /// does not fit in a `Duration`.
    pub fn try_min_interval(&self) -> Option<Duration> {
        let rpm = self.requests_per_minute;
        if !rpm.is_finite() || rpm <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(60.0 / rpm).ok()
    }

    /// Saturates at `Duration::MAX` for unusable rates.
    pub fn min_interval(&self) -> Duration {
        self.try_min_interval().unwrap_or(Duration::MAX)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    /// Earliest instant the next call may start.
    next_allowed: Instant,
}

/// Paces calls to at most `requests_per_minute`, spacing them by
/// `60 / rpm` seconds plus up to `jitter`.
///
/// - Blocking: callers sleep on their own thread
/// - The schedule is claimed under the lock; sleeping happens outside it
/// - One instance per rate domain, shared through `Arc`
#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    min_interval: Duration,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Result<Self> {
        // the schedule must stay representable as an Instant
        let min_interval = cfg.try_min_interval().filter(|interval| {
            interval
                .checked_add(cfg.jitter)
                .and_then(|step| Instant::now().checked_add(step))
                .is_some()
        });
        let Some(min_interval) = min_interval else {
            return Err(Error::configuration_with_context(
                "requests_per_minute must be positive and yield a representable interval",
                ErrorContext::new()
                    .with_field_path("rate_limit_rpm")
                    .with_details(cfg.requests_per_minute.to_string())
                    .with_source("rate_limiter"),
            ));
        };
        Ok(Self {
            cfg,
            min_interval,
            state: Mutex::new(State {
                next_allowed: Instant::now(),
            }),
        })
    }

    pub fn shared(cfg: RateLimiterConfig) -> Result<Arc<Self>> {
        Self::new(cfg).map(Arc::new)
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The schedule is a single Instant; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn jitter(&self) -> Duration {
        if self.cfg.jitter.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..=self.cfg.jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Claim the next slot and sleep until it opens.
    pub fn wait(&self) {
        let jitter = self.jitter();
        let slot = {
            let mut st = self.lock();
            let now = Instant::now();
            let slot = st.next_allowed.max(now);
            st.next_allowed = slot
                .checked_add(self.min_interval + jitter)
                .unwrap_or(slot);
            slot
        };

        let now = Instant::now();
        if slot > now {
            let wait = slot - now;
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter sleeping");
            std::thread::sleep(wait);
        }
    }

    /// Push the next slot at least `by` into the future (e.g. a server
    /// `retry-after` hint). Never moves the schedule backwards.
    pub fn delay(&self, by: Duration) {
        let mut st = self.lock();
        let Some(candidate) = Instant::now().checked_add(by) else {
            debug!(by_ms = by.as_millis() as u64, "delay out of range, ignored");
            return;
        };
        if candidate > st.next_allowed {
            st.next_allowed = candidate;
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let next_allowed = self.lock().next_allowed;
        let now = Instant::now();
        let estimated_wait_ms = if next_allowed > now {
            Some((next_allowed - now).as_millis() as u64)
        } else {
            None
        };
        RateLimiterSnapshot {
            requests_per_minute: self.cfg.requests_per_minute,
            min_interval: self.min_interval,
            jitter: self.cfg.jitter,
            estimated_wait_ms,
        }
    }
}

/// A callable that waits on a shared limiter before every invocation.
pub struct RateLimited<F> {
    limiter: Arc<RateLimiter>,
    inner: F,
}

impl<F> RateLimited<F> {
    pub fn new(limiter: Arc<RateLimiter>, inner: F) -> Self {
        Self { limiter, inner }
    }

    pub fn call<A: ?Sized, R>(&self, arg: &A) -> R
    where
        F: Fn(&A) -> R,
    {
        self.limiter.wait();
        (self.inner)(arg)
    }
}

pub fn rate_limited<F>(limiter: Arc<RateLimiter>, inner: F) -> RateLimited<F> {
    RateLimited::new(limiter, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rate_limiter_config_from_rpm() {
        let config = RateLimiterConfig::from_rpm(120.0).unwrap();
        assert_eq!(config.requests_per_minute, 120.0);
        assert_eq!(config.min_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_rate_limiter_config_from_rpm_invalid() {
        assert!(RateLimiterConfig::from_rpm(0.0).is_none());
        assert!(RateLimiterConfig::from_rpm(-1.0).is_none());
        assert!(RateLimiterConfig::from_rpm(f64::NAN).is_none());
        assert!(RateLimiterConfig::from_rpm(f64::INFINITY).is_none());
        assert!(RateLimiter::new(RateLimiterConfig::new().with_requests_per_minute(0.0)).is_err());
    }

    #[test]
    fn test_tiny_rpm_is_configuration_error() {
        assert!(RateLimiterConfig::from_rpm(1e-300).is_none());
        let cfg = RateLimiterConfig::new().with_requests_per_minute(1e-300);
        assert_eq!(cfg.try_min_interval(), None);
        assert_eq!(cfg.min_interval(), Duration::MAX);
        let err = RateLimiter::new(cfg).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("rate_limit_rpm")
        );
    }

    #[test]
    fn test_huge_delay_is_ignored() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(60.0).unwrap()).unwrap();
        limiter.delay(Duration::MAX);
        assert_eq!(limiter.snapshot().estimated_wait_ms, None);
    }

    #[test]
    fn test_rate_limiter_config_defaults() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.requests_per_minute, 20.0);
        assert_eq!(config.jitter, Duration::from_millis(250));
    }

    #[test]
    fn test_first_wait_is_immediate() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(1.0).unwrap()).unwrap();
        let start = Instant::now();
        limiter.wait();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_tight_loop_spacing() {
        // 600 rpm => 100ms interval; three waits span two intervals.
        let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(600.0).unwrap()).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_concurrent_waits_are_spaced() {
        let limiter =
            Arc::new(RateLimiter::new(RateLimiterConfig::from_rpm(1_200.0).unwrap()).unwrap());
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut handles = vec![];
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            let stamps = Arc::clone(&stamps);
            handles.push(thread::spawn(move || {
                for _ in 0..3 {
                    limiter.wait();
                    stamps.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 12);
        // 12 slots at 50ms => at least 11 intervals between first and last.
        let span = *stamps.last().unwrap() - stamps[0];
        assert!(span >= Duration::from_millis(11 * 50 - 20), "{span:?}");
    }

    #[test]
    fn test_delay_only_moves_forward() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(60.0).unwrap()).unwrap();
        limiter.delay(Duration::from_millis(300));
        let first = limiter.snapshot().estimated_wait_ms.unwrap();
        assert!(first > 200);

        limiter.delay(Duration::from_millis(10));
        let second = limiter.snapshot().estimated_wait_ms.unwrap();
        assert!(second > 200, "shorter delay must not pull the schedule back");
    }

    #[test]
    fn test_delay_blocks_next_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rpm(6_000.0).unwrap()).unwrap();
        limiter.delay(Duration::from_millis(80));
        let start = Instant::now();
        limiter.wait();
        assert!(start.elapsed() >= Duration::from_millis(70));
    }

    #[test]
    fn test_jitter_only_adds() {
        let config = RateLimiterConfig::from_rpm(1_200.0)
            .unwrap()
            .with_jitter(Duration::from_millis(20));
        let limiter = RateLimiter::new(config).unwrap();
        let start = Instant::now();
        limiter.wait();
        limiter.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_rate_limited_wrapper() {
        let limiter = RateLimiter::shared(RateLimiterConfig::from_rpm(600.0).unwrap()).unwrap();
        let double = rate_limited(limiter, |x: &u32| x * 2);
        let start = Instant::now();
        assert_eq!(double.call(&2), 4);
        assert_eq!(double.call(&3), 6);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
