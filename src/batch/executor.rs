//! Bounded worker-thread map executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;
use tracing::debug;

/// Fallback invoked with the worker's error and the item that produced it;
/// its return value takes the failed item's result slot.
pub type ErrorHandler<'a, T, R, E> = dyn Fn(E, &T) -> R + Sync + 'a;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on worker threads; never more threads than items are spawned.
    pub max_workers: usize,
    /// Return results in input order instead of completion order.
    pub preserve_order: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            max_workers: (cpus + 4).min(32),
            preserve_order: true,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }
    pub fn with_preserve_order(mut self, preserve: bool) -> Self {
        self.preserve_order = preserve;
        self
    }
}

/// Runs a worker function over every item on a fixed pool of scoped threads.
///
/// All items are queued at once; each pool thread pulls the next unclaimed
/// index until none remain, so every item is attempted exactly once. When a
/// worker fails and no [`ErrorHandler`] is given, the first failure to arrive
/// is returned after the pool has drained. Work already queued is not
/// cancelled.
pub struct ConcurrentMapExecutor {
    config: ExecutorConfig,
}

impl ConcurrentMapExecutor {
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
        }
    }
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config }
    }
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn run<T, R, E, F>(
        &self,
        items: &[T],
        worker: F,
        on_error: Option<&ErrorHandler<'_, T, R, E>>,
    ) -> std::result::Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> std::result::Result<R, E> + Sync,
    {
        self.run_with_state(items, || (), |_, item| worker(item), on_error)
    }

    /// Like [`run`](Self::run), but every pool thread first builds its own
    /// state with `init` and passes it mutably to each call it makes. State
    /// never crosses threads, so it needs to be neither `Send` nor `Sync`.
    pub fn run_with_state<T, R, E, S, I, F>(
        &self,
        items: &[T],
        init: I,
        worker: F,
        on_error: Option<&ErrorHandler<'_, T, R, E>>,
    ) -> std::result::Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        I: Fn() -> S + Sync,
        F: Fn(&mut S, &T) -> std::result::Result<R, E> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let workers = self.config.max_workers.max(1).min(items.len());
        let cursor = AtomicUsize::new(0);
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, std::result::Result<R, E>)>();

        let mut slots: Vec<(usize, R)> = Vec::with_capacity(items.len());
        let mut first_err: Option<E> = None;
        let mut failures = 0usize;

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let (cursor, init, worker) = (&cursor, &init, &worker);
                scope.spawn(move || {
                    let mut state = init();
                    loop {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(item) = items.get(index) else {
                            break;
                        };
                        let outcome = match worker(&mut state, item) {
                            Ok(r) => Ok(r),
                            Err(e) => match on_error {
                                Some(handler) => Ok(handler(e, item)),
                                None => Err(e),
                            },
                        };
                        if tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (index, outcome) in rx.iter() {
                match outcome {
                    Ok(r) => slots.push((index, r)),
                    Err(e) => {
                        failures += 1;
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
        });

        debug!(
            items = items.len(),
            workers,
            failures,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "concurrent map finished"
        );

        if let Some(e) = first_err {
            return Err(e);
        }
        if self.config.preserve_order {
            slots.sort_unstable_by_key(|(i, _)| *i);
        }
        Ok(slots.into_iter().map(|(_, r)| r).collect())
    }
}

impl Default for ConcurrentMapExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot form of [`ConcurrentMapExecutor::run`].
pub fn run_concurrent_map<T, R, E, F>(
    items: &[T],
    worker: F,
    max_workers: usize,
    preserve_order: bool,
    on_error: Option<&ErrorHandler<'_, T, R, E>>,
) -> std::result::Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(&T) -> std::result::Result<R, E> + Sync,
{
    ConcurrentMapExecutor::with_config(
        ExecutorConfig::new()
            .with_max_workers(max_workers)
            .with_preserve_order(preserve_order),
    )
    .run(items, worker, on_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_doubling_example() {
        let out = run_concurrent_map(
            &[1, 2, 3, 4, 5],
            |x: &i32| Ok::<_, String>(x * 2),
            2,
            true,
            None,
        )
        .unwrap();
        assert_eq!(out, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_identity_preserves_order_for_any_worker_count() {
        let items: Vec<u32> = (0..23).collect();
        for workers in 1..=items.len() + 10 {
            let out = run_concurrent_map(
                &items,
                |x: &u32| {
                    // Reverse the natural completion order a little.
                    thread::sleep(Duration::from_micros(u64::from(23 - *x) * 20));
                    Ok::<_, String>(*x)
                },
                workers,
                true,
                None,
            )
            .unwrap();
            assert_eq!(out, items, "max_workers = {workers}");
        }
    }

    #[test]
    fn test_on_error_sentinel_fills_every_slot() {
        let items = vec!["a", "b", "c", "d"];
        let handler = |_e: String, _item: &&str| -1i64;
        let out = run_concurrent_map(
            &items,
            |_: &&str| Err::<i64, _>("always".to_string()),
            3,
            true,
            Some(&handler),
        )
        .unwrap();
        assert_eq!(out, vec![-1; 4]);
    }

    #[test]
    fn test_on_error_receives_failing_item() {
        let items = vec![1, 2, 3, 4];
        let handler = |e: String, item: &i32| format!("{e}:{item}");
        let out = run_concurrent_map(
            &items,
            |x: &i32| {
                if x % 2 == 0 {
                    Err("even".to_string())
                } else {
                    Ok(x.to_string())
                }
            },
            4,
            true,
            Some(&handler),
        )
        .unwrap();
        assert_eq!(out, vec!["1", "even:2", "3", "even:4"]);
    }

    #[test]
    fn test_unhandled_error_propagates_after_all_items_attempted() {
        let attempted = AtomicUsize::new(0);
        let items: Vec<u32> = (0..20).collect();
        let result = run_concurrent_map(
            &items,
            |x: &u32| {
                attempted.fetch_add(1, Ordering::SeqCst);
                if *x == 7 {
                    Err(format!("item {x} failed"))
                } else {
                    Ok(*x)
                }
            },
            4,
            true,
            None,
        );
        assert_eq!(result.unwrap_err(), "item 7 failed");
        assert_eq!(attempted.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_completion_order_keeps_every_result() {
        let items: Vec<u32> = (0..50).collect();
        let out = run_concurrent_map(&items, |x: &u32| Ok::<_, ()>(*x), 8, false, None).unwrap();
        assert_eq!(out.len(), items.len());
        let seen: HashSet<u32> = out.into_iter().collect();
        assert_eq!(seen.len(), items.len());
    }

    #[test]
    fn test_empty_input() {
        let items: Vec<u8> = Vec::new();
        let out = ConcurrentMapExecutor::new()
            .run(&items, |_: &u8| -> Result<u8, ()> { panic!("never called") }, None)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_state_is_built_once_per_thread() {
        let inits = AtomicUsize::new(0);
        let threads = Mutex::new(HashSet::new());
        let executor = ConcurrentMapExecutor::with_config(ExecutorConfig::new().with_max_workers(3));
        let items: Vec<u32> = (0..30).collect();
        let out = executor
            .run_with_state(
                &items,
                || {
                    inits.fetch_add(1, Ordering::SeqCst);
                    0usize
                },
                |calls: &mut usize, x: &u32| {
                    *calls += 1;
                    threads.lock().unwrap().insert(thread::current().id());
                    Ok::<_, ()>(*x + 1)
                },
                None,
            )
            .unwrap();
        assert_eq!(out, (1..=30).collect::<Vec<u32>>());
        assert!(inits.load(Ordering::SeqCst) <= 3);
        assert!(inits.load(Ordering::SeqCst) >= threads.lock().unwrap().len());
    }

    #[test]
    fn test_never_more_threads_than_items() {
        let inits = AtomicUsize::new(0);
        let executor =
            ConcurrentMapExecutor::with_config(ExecutorConfig::new().with_max_workers(64));
        executor
            .run_with_state(
                &[1, 2],
                || inits.fetch_add(1, Ordering::SeqCst),
                |_, x: &i32| Ok::<_, ()>(*x),
                None,
            )
            .unwrap();
        assert!(inits.load(Ordering::SeqCst) <= 2);
    }
}
