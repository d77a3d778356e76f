//! End-to-end behavior of the executor, limiter and batch processor under
//! real thread contention.

use llm_throttle::batch::{run_concurrent_map, TpmBatchProcessor, TpmConfig};
use llm_throttle::resilience::{rate_limited, RateLimiter, RateLimiterConfig};
use llm_throttle::telemetry::MetricsRegistry;
use llm_throttle::tokens::{CharacterEstimator, TokenCounter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn limiter(rpm: f64) -> Arc<RateLimiter> {
    RateLimiter::shared(RateLimiterConfig::from_rpm(rpm).expect("positive rpm")).unwrap()
}

#[test]
fn test_doubling_through_tpm_processor() {
    let processor = TpmBatchProcessor::new(TpmConfig::new().with_max_workers(2), limiter(600_000.0));
    let out = processor.process(vec![1, 2, 3, 4, 5], |x: &i32| Ok::<_, String>(x * 2), |_| 1);
    assert_eq!(
        out,
        vec![(1, Some(2)), (2, Some(4)), (3, Some(6)), (4, Some(8)), (5, Some(10))]
    );
}

#[test]
fn test_identity_map_order_independent_of_workers() {
    let items: Vec<usize> = (0..25).collect();
    for workers in [1, 2, 7, 25, 40] {
        let out = run_concurrent_map(
            &items,
            |x: &usize| {
                thread::sleep(Duration::from_micros(((25 - x) * 50) as u64));
                Ok::<_, ()>(*x)
            },
            workers,
            true,
            None,
        )
        .unwrap();
        assert_eq!(out, items);
    }
}

#[test]
fn test_limiter_spaces_calls_across_threads() {
    // 1200 rpm = one call per 50 ms
    let limiter = limiter(1_200.0);
    let stamps = Mutex::new(Vec::new());
    let start = Instant::now();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..2 {
                    limiter.wait();
                    stamps.lock().unwrap().push(start.elapsed());
                }
            });
        }
    });
    let mut stamps = stamps.into_inner().unwrap();
    stamps.sort();
    assert_eq!(stamps.len(), 8);
    let span = stamps[7] - stamps[0];
    assert!(span >= Duration::from_millis(7 * 50 - 20), "span was {span:?}");
}

#[test]
fn test_rate_limited_wrapper_shares_one_schedule() {
    let shared = limiter(600.0);
    let double = rate_limited(Arc::clone(&shared), |x: &u32| x * 2);
    let start = Instant::now();
    assert_eq!(double.call(&1), 2);
    assert_eq!(double.call(&2), 4);
    assert_eq!(double.call(&3), 6);
    // 600 rpm = 100 ms spacing, the first call is free
    assert!(start.elapsed() >= Duration::from_millis(190));
}

#[test]
fn test_large_input_with_character_estimates() {
    let metrics = Arc::new(MetricsRegistry::new());
    let processor = TpmBatchProcessor::new(
        TpmConfig::new().with_max_workers(4).with_batch_size(16),
        limiter(6_000_000.0),
    )
    .with_metrics(Arc::clone(&metrics));
    let counter = CharacterEstimator::new();
    let calls = AtomicUsize::new(0);

    let docs: Vec<String> = (0..100).map(|i| format!("document number {i:03}")).collect();
    let expected_tokens: u64 = docs.iter().map(|d| counter.estimate_call(d, 0)).sum();

    let out = processor.process(
        docs.clone(),
        |doc: &String| {
            calls.fetch_add(1, Ordering::SeqCst);
            if doc.ends_with('7') {
                Err("flaky")
            } else {
                Ok(doc.len())
            }
        },
        |doc| counter.estimate_call(doc, 0),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 100);
    assert_eq!(out.len(), 100);
    for ((doc, result), original) in out.iter().zip(&docs) {
        assert_eq!(doc, original);
        assert_eq!(result.is_none(), doc.ends_with('7'));
    }
    assert_eq!(processor.window().current_tpm(), expected_tokens);

    let snap = metrics.snapshot();
    assert_eq!(snap.counter("tpm.batches"), 7);
    assert_eq!(snap.counter("tpm.failed"), 10);
    assert_eq!(snap.counter("tpm.succeeded"), 90);
    assert_eq!(snap.timing("tpm.batch").map(|t| t.count), Some(7));
}
