//! Blocking client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! This is where provider failures are turned into the crate's error taxonomy,
//! so everything above it can classify errors without looking at HTTP.

use crate::error::{Classify, Error, ErrorContext};
use crate::Result;
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "LLM_HTTP_TIMEOUT_SECS";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const QUOTA_CODE: &str = "insufficient_quota";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let timeout_secs = env::var(ENV_HTTP_TIMEOUT_SECS)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self {
            base_url: env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(timeout_secs),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// One agent per worker thread; it owns its HTTP connection pool.
#[derive(Debug)]
pub struct ChatCompletionsAgent {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    config: AgentConfig,
}

impl ChatCompletionsAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid base url: {}", config.base_url),
                    ErrorContext::new()
                        .with_field_path("base_url")
                        .with_details(e.to_string())
                        .with_source("chat_agent"),
                )
            })?;

        let api_key = config
            .api_key
            .clone()
            .or_else(|| env::var(ENV_API_KEY).ok())
            .filter(|k| !k.trim().is_empty());

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send one user prompt and return the assistant's text.
    pub fn complete(&self, prompt: &str) -> Result<String> {
        Ok(self.complete_with_usage(prompt)?.content)
    }

    pub fn complete_with_usage(&self, prompt: &str) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.config.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let start = Instant::now();
        let mut req = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send()?;
        let status = resp.status().as_u16();
        let retry_after = retry_after(resp.headers());
        let text = resp.text()?;

        if !(200..300).contains(&status) {
            let err = classify_failure(status, retry_after, &text);
            let class = err.class();
            info!(
                http_status = status,
                error_class = %class,
                model = self.config.model.as_str(),
                duration_ms = start.elapsed().as_millis() as u64,
                "chat completion failed"
            );
            return Err(err);
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::validation_empty("completion returned no content"))?;

        debug!(
            model = self.config.model.as_str(),
            duration_ms = start.elapsed().as_millis() as u64,
            total_tokens = parsed.usage.map(|u| u.total_tokens),
            "chat completion succeeded"
        );
        Ok(Completion {
            content,
            usage: parsed.usage,
        })
    }
}

fn header_first(headers: &HeaderMap, name: &str) -> Option<String> {
    let s = headers.get(name)?.to_str().ok()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Only the delta-seconds form of `Retry-After` is understood.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: f64 = header_first(headers, "retry-after")?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) fn classify_failure(status: u16, retry_after: Option<Duration>, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.error);
    let is_quota = parsed.as_ref().is_some_and(|e| {
        e.code.as_deref() == Some(QUOTA_CODE) || e.kind.as_deref() == Some(QUOTA_CODE)
    });
    let message = parsed
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        429 if is_quota => Error::quota_exceeded(message),
        429 => Error::RateLimited {
            message,
            retryable: true,
            retry_after,
        },
        401 | 403 => Error::Unauthorized { message },
        408 | 500..=599 => Error::Remote {
            status,
            message,
            retryable: true,
        },
        _ => Error::Remote {
            status,
            message,
            retryable: false,
        },
    }
}
