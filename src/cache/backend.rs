//! Cache backend implementations.

use super::key::CacheKey;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry {
    data: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
        }
    }
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;
    fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration);
    fn delete(&self, key: &CacheKey) -> bool;
    fn clear(&self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn name(&self) -> &'static str;
}

/// In-memory LRU with per-entry TTL.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut entries = self.lock();
        let expired = match entries.get(&key.hash) {
            Some(entry) if !entry.is_expired() => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&key.hash);
        }
        None
    }
    fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) {
        self.lock()
            .put(key.hash.clone(), CacheEntry::new(value.to_vec(), ttl));
    }
    fn delete(&self, key: &CacheKey) -> bool {
        self.lock().pop(&key.hash).is_some()
    }
    fn clear(&self) {
        self.lock().clear();
    }
    fn len(&self) -> usize {
        self.lock().iter().filter(|(_, e)| !e.is_expired()).count()
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for NullCache {
    fn get(&self, _: &CacheKey) -> Option<Vec<u8>> {
        None
    }
    fn set(&self, _: &CacheKey, _: &[u8], _: Duration) {}
    fn delete(&self, _: &CacheKey) -> bool {
        false
    }
    fn clear(&self) {}
    fn len(&self) -> usize {
        0
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
