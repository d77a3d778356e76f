//! # Response Caching Module
//!
//! Memoisation for expensive, deterministic-enough calls (identical prompt,
//! identical answer is acceptable), with pluggable backends.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | JSON front end with TTL and statistics |
//! | [`CacheConfig`] | Configuration for cache behavior and limits |
//! | [`CacheBackend`] | Trait for implementing custom cache backends |
//! | [`MemoryCache`] | In-memory LRU cache implementation |
//! | [`NullCache`] | No-op cache for disabling caching |
//! | [`CacheKey`] | SHA-256 key over a serializable argument |
//! | [`Cached`] | Wraps a function so successful results are reused |
//!
//! ```rust
//! use llm_throttle::cache::{cached, CacheConfig, CacheManager, MemoryCache};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(CacheManager::new(CacheConfig::new(), Box::new(MemoryCache::new(100))));
//! let upper = cached(manager, "upper", |s: &str| Ok::<_, ()>(s.to_uppercase()));
//! assert_eq!(upper.call("abc"), Ok("ABC".to_string()));
//! ```

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use key::CacheKey;
pub use manager::{cached, CacheConfig, CacheManager, CacheStats, Cached};
