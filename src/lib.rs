//! # llm-throttle
//!
//! Rate-governed concurrent execution of LLM calls over large item lists.
//!
//! ## Overview
//!
//! Calls to a paid, rate-limited model API are fanned out over a bounded pool
//! of OS worker threads. Before each call a worker consults a shared
//! tokens-per-minute window and a requests-per-minute limiter; failed calls are
//! retried with exponential backoff unless the failure is terminal (quota or
//! authorization) or an expected empty result.
//!
//! ## Key Features
//!
//! - **Concurrent map**: [`batch::ConcurrentMapExecutor`] with order preservation and error fallbacks
//! - **LLM runner**: [`LlmConcurrentRunner`] with per-thread agents, pacing and retries
//! - **TPM/RPM batches**: [`batch::TpmBatchProcessor`] for very large inputs
//! - **Resilience**: retry policies, rate limiter and token window via [`resilience`]
//! - **Caching**: memoisation of successful calls via [`cache`]
//! - **Telemetry**: injected metrics registry and tracing setup via [`telemetry`]
//!
//! ## Quick Start
//!
//! ```rust
//! use llm_throttle::batch::{TpmBatchProcessor, TpmConfig};
//! use llm_throttle::resilience::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::shared(
//!     RateLimiterConfig::new()
//!         .with_requests_per_minute(60_000.0)
//!         .with_jitter(Duration::ZERO),
//! )?;
//! let processor = TpmBatchProcessor::new(TpmConfig::new().with_max_workers(4), limiter);
//! let out = processor.process(
//!     vec![1, 2, 3, 4, 5],
//!     |x: &i32| Ok::<_, String>(x * 2),
//!     |_| 1,
//! );
//! let doubled: Vec<i32> = out.into_iter().filter_map(|(_, r)| r).collect();
//! assert_eq!(doubled, vec![2, 4, 6, 8, 10]);
//! # Ok::<(), llm_throttle::Error>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Concurrent map executor and TPM/RPM batch processor |
//! | [`client`] | LLM concurrent runner and chat-completions agent |
//! | [`resilience`] | Retry policies, rate limiting, token window |
//! | [`cache`] | Memoising cache with pluggable backends |
//! | [`config`] | Runtime configuration from YAML and environment |
//! | [`tokens`] | Token estimation |
//! | [`telemetry`] | Metrics registry and tracing initialisation |

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod resilience;
pub mod telemetry;
pub mod tokens;

// Re-export main types for convenience
pub use client::{AgentConfig, ChatCompletionsAgent, LlmConcurrentRunner, RunnerConfig};
pub use config::RuntimeConfig;
pub use error::{Classify, Error, ErrorClass, ErrorContext};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
