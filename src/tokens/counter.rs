//! Token counter implementations.

use std::collections::HashMap;
use std::sync::RwLock;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Prompt tokens plus an allowance for the completion, as a budget figure.
    fn estimate_call(&self, prompt: &str, max_completion_tokens: usize) -> u64 {
        (self.count(prompt) + max_completion_tokens) as u64
    }
}

/// Character-ratio approximation (4 chars ≈ 1 token by default).
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}
impl CharacterEstimator {
    pub fn new() -> Self {
        Self::with_ratio(4.0)
    }
    pub fn with_ratio(r: f64) -> Self {
        Self { chars_per_token: r }
    }
}
impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new()
    }
}
impl TokenCounter for CharacterEstimator {
    fn count(&self, text: &str) -> usize {
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Memoises counts of an inner counter, up to `max_size` distinct texts.
pub struct CachingCounter {
    inner: Box<dyn TokenCounter>,
    cache: RwLock<HashMap<String, usize>>,
    max_size: usize,
}
impl CachingCounter {
    pub fn new(inner: Box<dyn TokenCounter>, max_size: usize) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            max_size,
        }
    }
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}
impl TokenCounter for CachingCounter {
    fn count(&self, text: &str) -> usize {
        {
            let c = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(&n) = c.get(text) {
                return n;
            }
        }
        let n = self.inner.count(text);
        let mut c = self.cache.write().unwrap_or_else(|p| p.into_inner());
        if c.len() < self.max_size {
            c.insert(text.to_string(), n);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_estimator_rounds_up() {
        let counter = CharacterEstimator::new();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcdefghi"), 3);
    }

    #[test]
    fn test_estimate_call_adds_completion_budget() {
        let counter = CharacterEstimator::new();
        assert_eq!(counter.estimate_call("abcdefgh", 100), 102);
    }

    #[test]
    fn test_caching_counter_respects_max_size() {
        let counter = CachingCounter::new(Box::new(CharacterEstimator::new()), 2);
        assert_eq!(counter.count("aaaa"), 1);
        assert_eq!(counter.count("aaaa"), 1);
        counter.count("bbbbbbbb");
        counter.count("cccccccccccc");
        assert_eq!(counter.cached_len(), 2);
        counter.clear_cache();
        assert_eq!(counter.cached_len(), 0);
    }
}
