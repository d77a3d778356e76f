//! Cache manager and the memoising wrapper.

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub enabled: bool,
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            enabled: true,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
    fn reset(&self) {
        for c in [&self.hits, &self.misses, &self.sets, &self.errors] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// JSON-serializing front end over a [`CacheBackend`], with hit statistics.
pub struct CacheManager {
    config: CacheConfig,
    backend: Box<dyn CacheBackend>,
    stats: AtomicStats,
}

impl CacheManager {
    pub fn new(config: CacheConfig, backend: Box<dyn CacheBackend>) -> Self {
        Self {
            config,
            backend,
            stats: AtomicStats::default(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let prefixed = self.prefix_key(key);
        match self.backend.get(&prefixed) {
            Some(data) => match serde_json::from_slice(&data) {
                Ok(val) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(val)
                }
                Err(e) => {
                    debug!(key = %prefixed, error = %e, "dropping undecodable cache entry");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.backend.delete(&prefixed);
                    None
                }
            },
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.config.default_ttl)
    }

    pub fn set_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let data = serde_json::to_vec(value)?;
        if data.len() > self.config.max_entry_size {
            return Ok(());
        }
        let prefixed = self.prefix_key(key);
        self.backend.set(&prefixed, &data, ttl);
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.backend.delete(&self.prefix_key(key))
    }

    /// Drop every entry and zero the statistics.
    pub fn clear(&self) {
        self.backend.clear();
        self.stats.reset();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn prefix_key(&self, key: &CacheKey) -> CacheKey {
        if let Some(ref p) = self.config.key_prefix {
            CacheKey::new(format!("{}:{}", p, key.hash))
        } else {
            key.clone()
        }
    }
}

/// A fallible function whose successful results are memoised by argument.
pub struct Cached<F> {
    cache: Arc<CacheManager>,
    namespace: String,
    inner: F,
}

impl<F> Cached<F> {
    pub fn new(cache: Arc<CacheManager>, namespace: impl Into<String>, inner: F) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
            inner,
        }
    }

    /// Serve from cache, or call through and remember a success. Failures
    /// are never cached.
    pub fn call<A, R, E>(&self, arg: &A) -> std::result::Result<R, E>
    where
        A: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> std::result::Result<R, E>,
    {
        let key = match CacheKey::for_value(&self.namespace, arg) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "argument not hashable, bypassing cache");
                return (self.inner)(arg);
            }
        };
        if let Some(hit) = self.cache.get::<R>(&key) {
            return Ok(hit);
        }
        let value = (self.inner)(arg)?;
        if let Err(e) = self.cache.set(&key, &value) {
            debug!(error = %e, "result not cacheable");
        }
        Ok(value)
    }
}

pub fn cached<F>(cache: Arc<CacheManager>, namespace: impl Into<String>, inner: F) -> Cached<F> {
    Cached::new(cache, namespace, inner)
}
