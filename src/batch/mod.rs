//! # Batch Execution Module
//!
//! Fan a list of items out over a bounded pool of OS threads, either as a
//! single concurrent map or as sequential waves governed by a tokens-per-minute
//! and requests-per-minute budget.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ConcurrentMapExecutor`] | Bounded thread pool mapping a fallible worker over a slice |
//! | [`ExecutorConfig`] | Worker count and result ordering |
//! | [`run_concurrent_map`] | One-shot helper over the executor |
//! | [`TpmBatchProcessor`] | Wave-based processing under TPM/RPM limits |
//! | [`TpmConfig`] | Workers, TPM target and wave size |
//!
//! ## Example
//!
//! ```rust
//! use llm_throttle::batch::run_concurrent_map;
//!
//! let doubled = run_concurrent_map(&[1, 2, 3], |x: &i32| Ok::<_, String>(x * 2), 4, true, None);
//! assert_eq!(doubled.unwrap(), vec![2, 4, 6]);
//! ```
//!
//! ## Error handling
//!
//! Without an error handler the first failure (in completion order) is
//! returned once every started item has finished. With a handler, each
//! failure is converted into a result and the map always succeeds.

mod executor;
mod tpm;

pub use executor::{run_concurrent_map, ConcurrentMapExecutor, ErrorHandler, ExecutorConfig};
pub use tpm::{TpmBatchProcessor, TpmConfig};
