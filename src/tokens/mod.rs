//! # Token Estimation Module
//!
//! Cheap token estimates used to reserve budget in the tokens-per-minute
//! window before a call is made.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TokenCounter`] | Trait for token counting implementations |
//! | [`CharacterEstimator`] | Fast character-based approximation (4 chars ≈ 1 token) |
//! | [`CachingCounter`] | Wrapper that caches token counts |
//!
//! ```rust
//! use llm_throttle::tokens::{CharacterEstimator, TokenCounter};
//!
//! let counter = CharacterEstimator::new();
//! assert_eq!(counter.count("Hello, how are you?"), 5);
//! ```

mod counter;

pub use counter::{CachingCounter, CharacterEstimator, TokenCounter};
