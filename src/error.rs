use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "retry.multiplier")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "chat_agent")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for rate-governed LLM execution.
///
/// The first four variants form the closed taxonomy that the I/O boundary
/// (see [`crate::client::ChatCompletionsAgent`]) maps provider failures into.
/// Retry and batch code never inspects messages; it matches on [`ErrorClass`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retryable: bool,
        retry_after: Option<Duration>,
    },

    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("No extractable content: {message}")]
    ValidationEmpty { message: String },

    #[error("Remote error: HTTP {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// Closed classification of failures, as seen by retry and batch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider throttled the call. Non-retryable when the provider says so.
    RateLimited { retryable: bool },
    /// Account quota or billing limit reached. Never retried.
    QuotaExceeded,
    /// Missing or rejected credentials. Never retried.
    Unauthorized,
    /// The call succeeded but produced nothing to extract. Never retried.
    ValidationEmpty,
    /// Anything else.
    Other { retryable: bool },
}

impl ErrorClass {
    /// Quota, authorization and hard rate-limit rejections.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorClass::QuotaExceeded
                | ErrorClass::Unauthorized
                | ErrorClass::RateLimited { retryable: false }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorClass::RateLimited { retryable } | ErrorClass::Other { retryable } => *retryable,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited { .. } => "rate_limited",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::ValidationEmpty => "validation_empty",
            ErrorClass::Other { .. } => "other",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can report their [`ErrorClass`] to the retry machinery.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server-provided backoff hint, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::RateLimited { retryable, .. } => ErrorClass::RateLimited {
                retryable: *retryable,
            },
            Error::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            Error::Unauthorized { .. } => ErrorClass::Unauthorized,
            Error::ValidationEmpty { .. } => ErrorClass::ValidationEmpty,
            Error::Remote { retryable, .. } => ErrorClass::Other {
                retryable: *retryable,
            },
            Error::Transport(e) => ErrorClass::Other {
                retryable: e.is_timeout() || e.is_connect() || e.is_request(),
            },
            Error::Io(_) | Error::Runtime { .. } => ErrorClass::Other { retryable: true },
            Error::Configuration { .. }
            | Error::Validation { .. }
            | Error::Serialization(_)
            | Error::Yaml(_) => ErrorClass::Other { retryable: false },
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Error::QuotaExceeded {
            message: msg.into(),
        }
    }

    pub fn validation_empty(msg: impl Into<String>) -> Self {
        Error::ValidationEmpty {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}
