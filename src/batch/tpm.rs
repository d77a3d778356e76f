//! Tokens-per-minute / requests-per-minute governed batch processing.

use super::executor::{ConcurrentMapExecutor, ExecutorConfig};
use crate::resilience::token_window::{DEFAULT_OVERSHOOT, DEFAULT_SOFT_BLOCK};
use crate::resilience::{RateLimiter, TokenWindow};
use crate::telemetry::MetricsRegistry;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

const MAX_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone)]
pub struct TpmConfig {
    pub max_workers: usize,
    pub target_tpm: u64,
    /// Items per wave; defaults to `min(max_workers * 2, 1000)`.
    pub batch_size: Option<usize>,
    /// Usage factor over `target_tpm` tolerated before callers are slowed.
    pub overshoot: f64,
    /// Fixed pause taken once usage is past the overshoot limit.
    pub soft_block: Duration,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            target_tpm: 90_000,
            batch_size: None,
            overshoot: DEFAULT_OVERSHOOT,
            soft_block: DEFAULT_SOFT_BLOCK,
        }
    }
}

impl TpmConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }
    pub fn with_target_tpm(mut self, tpm: u64) -> Self {
        self.target_tpm = tpm;
        self
    }
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
    pub fn with_overshoot(mut self, factor: f64) -> Self {
        self.overshoot = factor;
        self
    }
    pub fn with_soft_block(mut self, pause: Duration) -> Self {
        self.soft_block = pause;
        self
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size
            .unwrap_or_else(|| (self.max_workers * 2).min(MAX_BATCH_SIZE))
            .max(1)
    }
}

/// Drives a processing function over a large item list in sequential waves.
///
/// Inside a wave items run concurrently. Before each call a worker reserves
/// the item's estimated tokens in the shared [`TokenWindow`] and then waits
/// its turn on the [`RateLimiter`]. A failing item is logged and yields
/// `None`; it never aborts its wave or the run.
pub struct TpmBatchProcessor {
    config: TpmConfig,
    limiter: Arc<RateLimiter>,
    window: Arc<TokenWindow>,
    metrics: Option<Arc<MetricsRegistry>>,
    run_id: Option<Uuid>,
}

impl TpmBatchProcessor {
    pub fn new(config: TpmConfig, limiter: Arc<RateLimiter>) -> Self {
        let window = TokenWindow::new(config.target_tpm)
            .with_overshoot(config.overshoot)
            .with_soft_block(config.soft_block);
        Self {
            config,
            limiter,
            window: Arc::new(window),
            metrics: None,
            run_id: None,
        }
    }

    /// Share a token window with other processors hitting the same budget.
    pub fn with_window(mut self, window: Arc<TokenWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tag every run's span with `id` instead of a fresh one, so callers can
    /// correlate their own logs with the processor's.
    pub fn with_run_id(mut self, id: Uuid) -> Self {
        self.run_id = Some(id);
        self
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    pub fn config(&self) -> &TpmConfig {
        &self.config
    }

    pub fn window(&self) -> &Arc<TokenWindow> {
        &self.window
    }

    /// Returns one `(item, result)` pair per input item, in input order.
    pub fn process<T, R, E, F, G>(&self, items: Vec<T>, processor: F, estimator: G) -> Vec<(T, Option<R>)>
    where
        T: Sync,
        R: Send,
        E: Display,
        F: Fn(&T) -> std::result::Result<R, E> + Sync,
        G: Fn(&T) -> u64 + Sync,
    {
        self.process_with_state(items, || (), |_, item| processor(item), estimator)
    }

    /// Like [`process`](Self::process), but each pool thread of a wave first
    /// builds its own state with `init` (typically an API client) and hands it
    /// to every call it makes.
    pub fn process_with_state<T, R, E, S, I, F, G>(
        &self,
        items: Vec<T>,
        init: I,
        processor: F,
        estimator: G,
    ) -> Vec<(T, Option<R>)>
    where
        T: Sync,
        R: Send,
        E: Display,
        I: Fn() -> S + Sync,
        F: Fn(&mut S, &T) -> std::result::Result<R, E> + Sync,
        G: Fn(&T) -> u64 + Sync,
    {
        if items.is_empty() {
            return Vec::new();
        }

        let run_id = self.run_id.unwrap_or_else(Uuid::new_v4);
        let span = info_span!("tpm_batch", run = %run_id);
        let _guard = span.enter();

        let executor = ConcurrentMapExecutor::with_config(
            ExecutorConfig::new()
                .with_max_workers(self.config.max_workers)
                .with_preserve_order(true),
        );
        let batch_size = self.config.effective_batch_size();
        let total_batches = items.len().div_ceil(batch_size);
        let started = Instant::now();
        info!(
            items = items.len(),
            batch_size,
            batches = total_batches,
            max_workers = self.config.max_workers,
            target_tpm = self.config.target_tpm,
            "starting batch run"
        );

        let mut results: Vec<Option<R>> = Vec::with_capacity(items.len());
        let mut succeeded = 0usize;

        for (n, batch) in items.chunks(batch_size).enumerate() {
            let batch_started = Instant::now();
            let outcome = executor.run_with_state(
                batch,
                &init,
                |state, item| Ok::<_, Infallible>(self.process_one(state, item, &processor, &estimator)),
                None,
            );
            let out = match outcome {
                Ok(out) => out,
                Err(never) => match never {},
            };

            let ok = out.iter().filter(|r| r.is_some()).count();
            succeeded += ok;
            let rolling_tpm = self.window.current_tpm();
            let elapsed = batch_started.elapsed();
            info!(
                batch = n + 1,
                batches = total_batches,
                size = batch.len(),
                ok,
                succeeded,
                rolling_tpm,
                elapsed_ms = elapsed.as_millis() as u64,
                "batch complete"
            );
            if let Some(m) = &self.metrics {
                m.incr("tpm.batches", 1);
                m.set_gauge("tpm.rolling", rolling_tpm as f64);
                m.record_duration("tpm.batch", elapsed);
            }
            results.extend(out);
        }

        let elapsed = started.elapsed();
        info!(
            items = items.len(),
            succeeded,
            failed = items.len() - succeeded,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch run finished"
        );

        items.into_iter().zip(results).collect()
    }

    fn process_one<T, R, E, S, F, G>(&self, state: &mut S, item: &T, processor: &F, estimator: &G) -> Option<R>
    where
        E: Display,
        F: Fn(&mut S, &T) -> std::result::Result<R, E>,
        G: Fn(&T) -> u64,
    {
        let estimated = estimator(item);
        if self.window.reserve(estimated) {
            if let Some(m) = &self.metrics {
                m.incr("tpm.soft_blocks", 1);
            }
        }
        self.limiter.wait();

        let call_started = Instant::now();
        let result = processor(state, item);
        if let Some(m) = &self.metrics {
            m.record_duration("tpm.call", call_started.elapsed());
        }
        match result {
            Ok(r) => {
                debug!(estimated_tokens = estimated, "item processed");
                if let Some(m) = &self.metrics {
                    m.incr("tpm.succeeded", 1);
                }
                Some(r)
            }
            Err(e) => {
                warn!(error = %e, estimated_tokens = estimated, "item failed");
                if let Some(m) = &self.metrics {
                    m.incr("tpm.failed", 1);
                }
                None
            }
        }
    }
}
