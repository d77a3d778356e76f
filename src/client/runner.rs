//! Concurrent, retrying LLM call runner.

use crate::batch::{ConcurrentMapExecutor, ErrorHandler, ExecutorConfig};
use crate::cache::{CacheKey, CacheManager};
use crate::error::{Classify, Error};
use crate::resilience::{with_retry, ExponentialBackoff, RateLimiter};
use crate::telemetry::MetricsRegistry;
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Called with the final error and the chunk that produced it; its return
/// value takes the chunk's place in the output.
pub type RunnerErrorHandler<'a, T, R> = dyn Fn(&Error, &T) -> R + Sync + 'a;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_workers: usize,
    /// Extra attempts after the first.
    pub retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Per-worker call rate; `None` disables pacing.
    pub qps: Option<f64>,
    /// Scale each backoff by a uniform factor in `[0.75, 1.25)`.
    pub jitter: bool,
    pub cache_namespace: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            retries: 2,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            qps: None,
            jitter: true,
            cache_namespace: "llm_runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
    /// Rates that are not positive, or too small for the interval to fit in a
    /// `Duration`, disable pacing.
    pub fn with_qps(mut self, qps: f64) -> Self {
        self.qps = Some(qps).filter(|q| pacing_interval(*q).is_some());
        if self.qps.is_none() {
            warn!(qps, "unusable qps, pacing disabled");
        }
        self
    }
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
    pub fn with_cache_namespace(mut self, ns: impl Into<String>) -> Self {
        self.cache_namespace = ns.into();
        self
    }
}

fn pacing_interval(qps: f64) -> Option<Duration> {
    if qps.is_finite() && qps > 0.0 {
        Duration::try_from_secs_f64(1.0 / qps).ok()
    } else {
        None
    }
}

struct WorkerSlot<A> {
    agent: A,
    last_call: Option<Instant>,
}

/// Maps chunks through an LLM call on a bounded pool of worker threads.
///
/// Every worker thread builds its own agent through the factory and keeps it
/// for all chunks it handles, so agents never cross threads. Each call is
/// paced per worker (`qps`), optionally gated by a shared [`RateLimiter`],
/// and retried with exponential backoff unless the error class is terminal.
/// Results come back in input order.
pub struct LlmConcurrentRunner {
    config: RunnerConfig,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl LlmConcurrentRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            limiter: None,
            metrics: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> ExponentialBackoff {
        let policy = ExponentialBackoff::new()
            .with_max_attempts(self.config.retries.saturating_add(1))
            .with_base_delay(self.config.backoff)
            .with_max_delay(self.config.max_backoff)
            .with_multiplier(2.0);
        if self.config.jitter {
            policy.with_jitter(0.75, 1.25)
        } else {
            policy
        }
    }

    pub fn run<T, R, A, Fa, C>(
        &self,
        chunks: &[T],
        agent_factory: Fa,
        call: C,
        on_error: Option<&RunnerErrorHandler<'_, T, R>>,
    ) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        Fa: Fn() -> A + Sync,
        C: Fn(&mut A, &T) -> Result<R> + Sync,
    {
        self.execute(chunks, agent_factory, call, on_error, |_| None, |_, _| {})
    }

    /// Like [`run`](Self::run), but successful results are memoised in
    /// `cache` keyed by the chunk, and cached chunks skip the call entirely.
    pub fn run_cached<T, R, A, Fa, C>(
        &self,
        chunks: &[T],
        cache: &CacheManager,
        agent_factory: Fa,
        call: C,
        on_error: Option<&RunnerErrorHandler<'_, T, R>>,
    ) -> Result<Vec<R>>
    where
        T: Serialize + Sync,
        R: Serialize + DeserializeOwned + Send,
        Fa: Fn() -> A + Sync,
        C: Fn(&mut A, &T) -> Result<R> + Sync,
    {
        let namespace = self.config.cache_namespace.as_str();
        self.execute(
            chunks,
            agent_factory,
            call,
            on_error,
            |chunk| {
                let key = CacheKey::for_value(namespace, chunk).ok()?;
                cache.get(&key)
            },
            |chunk, result| {
                let stored = CacheKey::for_value(namespace, chunk).and_then(|key| cache.set(&key, result));
                if let Err(e) = stored {
                    debug!(error = %e, "runner result not cached");
                }
            },
        )
    }

    fn execute<T, R, A, Fa, C, L, S>(
        &self,
        chunks: &[T],
        agent_factory: Fa,
        call: C,
        on_error: Option<&RunnerErrorHandler<'_, T, R>>,
        lookup: L,
        store: S,
    ) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        Fa: Fn() -> A + Sync,
        C: Fn(&mut A, &T) -> Result<R> + Sync,
        L: Fn(&T) -> Option<R> + Sync,
        S: Fn(&T, &R) + Sync,
    {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let policy = self.retry_policy();
        let executor = ConcurrentMapExecutor::with_config(
            ExecutorConfig::new()
                .with_max_workers(self.config.max_workers)
                .with_preserve_order(true),
        );
        let fallback = on_error.map(|handler| move |e: Error, chunk: &T| handler(&e, chunk));
        let handler = fallback
            .as_ref()
            .map(|f| f as &ErrorHandler<'_, T, R, Error>);

        let start = Instant::now();
        let out = executor.run_with_state(
            chunks,
            || WorkerSlot {
                agent: agent_factory(),
                last_call: None,
            },
            |slot, chunk| {
                if let Some(hit) = lookup(chunk) {
                    self.count("runner.cache_hits");
                    return Ok(hit);
                }

                let call_started = Instant::now();
                let result = with_retry(&policy, || {
                    self.pace(&mut slot.last_call);
                    if let Some(limiter) = &self.limiter {
                        limiter.wait();
                    }
                    let outcome = call(&mut slot.agent, chunk);
                    if let (Err(e), Some(limiter)) = (&outcome, &self.limiter) {
                        if let Some(hint) = e.retry_after() {
                            limiter.delay(hint);
                        }
                    }
                    outcome
                });
                if let Some(m) = &self.metrics {
                    m.record_duration("runner.call", call_started.elapsed());
                }

                match &result {
                    Ok(r) => {
                        self.count("runner.succeeded");
                        store(chunk, r);
                    }
                    Err(_) => self.count("runner.failed"),
                }
                result
            },
            handler,
        );

        info!(
            chunks = chunks.len(),
            workers = self.config.max_workers.min(chunks.len()),
            ok = out.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "runner finished"
        );
        out
    }

    /// Sleep until this worker's previous call is at least `1 / qps` old.
    fn pace(&self, last_call: &mut Option<Instant>) {
        if let Some(interval) = self.config.qps.and_then(pacing_interval) {
            if let Some(prev) = *last_call {
                let elapsed = prev.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }
        *last_call = Some(Instant::now());
    }

    fn count(&self, name: &str) {
        if let Some(m) = &self.metrics {
            m.incr(name, 1);
        }
    }
}

impl Default for LlmConcurrentRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MemoryCache};
    use crate::resilience::RateLimiterConfig;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast(config: RunnerConfig) -> LlmConcurrentRunner {
        LlmConcurrentRunner::new(
            config
                .with_backoff(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    struct Agent {
        id: usize,
        calls: usize,
    }

    #[test]
    fn test_preserves_order_and_builds_one_agent_per_thread() {
        let built = AtomicUsize::new(0);
        let seen = Mutex::new(HashSet::new());
        let runner = fast(RunnerConfig::new().with_max_workers(3));
        let chunks: Vec<u32> = (0..20).collect();
        let out = runner
            .run(
                &chunks,
                || Agent {
                    id: built.fetch_add(1, Ordering::SeqCst),
                    calls: 0,
                },
                |agent, chunk| {
                    agent.calls += 1;
                    seen.lock().unwrap().insert(agent.id);
                    std::thread::sleep(Duration::from_millis((20 - *chunk as u64) % 4));
                    Ok(format!("{}:{}", chunk, agent.calls > 0))
                },
                None,
            )
            .unwrap();
        let expected: Vec<String> = chunks.iter().map(|c| format!("{}:true", c)).collect();
        assert_eq!(out, expected);
        assert!(built.load(Ordering::SeqCst) <= 3);
        assert!(seen.lock().unwrap().len() <= 3);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let calls = AtomicUsize::new(0);
        let runner = fast(RunnerConfig::new().with_max_workers(1).with_retries(2));
        let out = runner
            .run(
                &["chunk"],
                || (),
                |_, chunk| {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Remote {
                            status: 503,
                            message: "busy".into(),
                            retryable: true,
                        })
                    } else {
                        Ok(chunk.len())
                    }
                },
                None,
            )
            .unwrap();
        assert_eq!(out, vec![5]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_quota_goes_straight_to_handler() {
        let calls = AtomicUsize::new(0);
        let metrics = Arc::new(MetricsRegistry::new());
        let runner = fast(RunnerConfig::new().with_retries(5)).with_metrics(Arc::clone(&metrics));
        let handler = |e: &Error, chunk: &&str| format!("{} failed: {}", chunk, e.class());
        let out = runner
            .run(
                &["a"],
                || (),
                |_, _| -> Result<String> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::quota_exceeded("no credit"))
                },
                Some(&handler),
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out, vec!["a failed: quota_exceeded".to_string()]);
        assert_eq!(metrics.snapshot().counter("runner.failed"), 1);
    }

    #[test]
    fn test_unhandled_failure_propagates() {
        let runner = fast(RunnerConfig::new().with_retries(0));
        let err = runner
            .run(
                &[1, 2, 3],
                || (),
                |_, x: &i32| {
                    if *x == 2 {
                        Err(Error::Unauthorized {
                            message: "bad key".into(),
                        })
                    } else {
                        Ok(*x)
                    }
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[test]
    fn test_qps_paces_each_worker() {
        let runner = fast(RunnerConfig::new().with_max_workers(1).with_qps(50.0));
        let start = Instant::now();
        runner
            .run(&[1, 2, 3], || (), |_, x: &i32| Ok(*x), None)
            .unwrap();
        // three calls on one worker are at least two 20 ms intervals apart
        assert!(start.elapsed() >= Duration::from_millis(38));
    }

    #[test]
    fn test_unusable_qps_disables_pacing() {
        for qps in [1e-300, 0.0, -3.0, f64::NAN] {
            assert_eq!(RunnerConfig::new().with_qps(qps).qps, None, "qps {qps}");
        }
        let runner = fast(RunnerConfig::new().with_max_workers(1).with_qps(1e-300));
        let start = Instant::now();
        let out = runner
            .run(&[1, 2, 3], || (), |_, x: &i32| Ok(*x), None)
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_pushes_shared_limiter() {
        let limiter = RateLimiter::shared(RateLimiterConfig::from_rpm(600_000.0).unwrap()).unwrap();
        let runner = fast(RunnerConfig::new().with_max_workers(1).with_retries(0))
            .with_rate_limiter(Arc::clone(&limiter));
        let _ = runner.run(
            &[()],
            || (),
            |_, _| -> Result<()> {
                Err(Error::RateLimited {
                    message: "slow".into(),
                    retryable: true,
                    retry_after: Some(Duration::from_secs(30)),
                })
            },
            None,
        );
        let wait = limiter.snapshot().estimated_wait_ms.unwrap_or(0);
        assert!(wait > 20_000, "limiter wait was {wait} ms");
    }

    #[test]
    fn test_cached_run_skips_repeat_calls() {
        let cache = CacheManager::new(CacheConfig::new(), Box::new(MemoryCache::new(64)));
        let calls = AtomicUsize::new(0);
        let runner = fast(RunnerConfig::new().with_max_workers(2));
        let chunks = vec!["x".to_string(), "y".to_string()];
        let call = |_: &mut (), c: &String| -> Result<String> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(c.to_uppercase())
        };
        let first = runner.run_cached(&chunks, &cache, || (), call, None).unwrap();
        let second = runner.run_cached(&chunks, &cache, || (), call, None).unwrap();
        assert_eq!(first, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_empty_chunks() {
        let runner = LlmConcurrentRunner::default();
        let out: Vec<u8> = runner
            .run(&[] as &[u8], || panic!("no agent needed"), |_: &mut (), x| Ok(*x), None)
            .unwrap();
        assert!(out.is_empty());
    }
}
