//! LLM call execution: the concurrent runner and an HTTP agent for it.
//!
//! Implementation details are split into submodules under `src/client/`.

pub mod http;
pub mod runner;

pub use http::{AgentConfig, ChatCompletionsAgent, Completion, Usage};
pub use runner::{LlmConcurrentRunner, RunnerConfig, RunnerErrorHandler};
