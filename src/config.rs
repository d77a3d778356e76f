//! Runtime configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional YAML file and environment variables. Unparseable environment
//! values are ignored with a warning so a typo never takes a batch run down.

use crate::batch::TpmConfig;
use crate::error::{Error, ErrorContext};
use crate::resilience::{ExponentialBackoff, RateLimiterConfig};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_RATE_LIMIT_RPM: &str = "RATE_LIMIT_RPM";
pub const ENV_RATE_LIMIT_JITTER_MS: &str = "RATE_LIMIT_JITTER_MS";
pub const ENV_TARGET_TPM: &str = "LLM_TARGET_TPM";
pub const ENV_MAX_WORKERS: &str = "LLM_MAX_WORKERS";
pub const ENV_BATCH_SIZE: &str = "LLM_BATCH_SIZE";

/// Retry settings as they appear in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub rate_limit_rpm: u32,
    pub rate_limit_jitter_ms: u64,
    pub target_tpm: u64,
    pub max_workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    pub retry: RetrySettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rate_limit_rpm: 20,
            rate_limit_jitter_ms: 250,
            target_tpm: 90_000,
            max_workers: 8,
            batch_size: None,
            retry: RetrySettings::default(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text).map_err(|e| {
            Error::configuration_with_context(
                "invalid configuration document",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config_loader"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// YAML file, then environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read {}", path.display()),
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config_loader"),
            )
        })?;
        let mut cfg = Self::from_yaml_str(&text)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse(ENV_RATE_LIMIT_RPM) {
            self.rate_limit_rpm = v;
        }
        if let Some(v) = env_parse(ENV_RATE_LIMIT_JITTER_MS) {
            self.rate_limit_jitter_ms = v;
        }
        if let Some(v) = env_parse(ENV_TARGET_TPM) {
            self.target_tpm = v;
        }
        if let Some(v) = env_parse(ENV_MAX_WORKERS) {
            self.max_workers = v;
        }
        if let Some(v) = env_parse(ENV_BATCH_SIZE) {
            self.batch_size = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("config_validator"),
            ))
        };
        if self.rate_limit_rpm == 0 {
            return invalid("rate_limit_rpm", "requests per minute must be positive");
        }
        if self.max_workers == 0 {
            return invalid("max_workers", "at least one worker is required");
        }
        if self.batch_size == Some(0) {
            return invalid("batch_size", "batch size must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "at least one attempt is required");
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier > 0.0) {
            return invalid("retry.multiplier", "multiplier must be positive");
        }
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new()
            .with_requests_per_minute(f64::from(self.rate_limit_rpm))
            .with_jitter(Duration::from_millis(self.rate_limit_jitter_ms))
    }

    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_multiplier(self.retry.multiplier)
    }

    pub fn tpm_config(&self) -> TpmConfig {
        let mut cfg = TpmConfig::new()
            .with_max_workers(self.max_workers)
            .with_target_tpm(self.target_tpm);
        if let Some(size) = self.batch_size {
            cfg = cfg.with_batch_size(size);
        }
        cfg
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.rate_limit_rpm, 20);
        assert_eq!(cfg.rate_limit_jitter_ms, 250);
        assert!(cfg.validate().is_ok());
        let rl = cfg.rate_limiter_config();
        assert_eq!(rl.min_interval(), Duration::from_secs(3));
        assert_eq!(rl.jitter, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = RuntimeConfig::from_yaml_str(
            "rate_limit_rpm: 60\nretry:\n  max_attempts: 5\n",
        )
        .unwrap();
        assert_eq!(cfg.rate_limit_rpm, 60);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.target_tpm, 90_000);
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = RuntimeConfig::from_yaml_str("rate_limit_rpm: [oops").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_rpm() {
        let err = RuntimeConfig::from_yaml_str("rate_limit_rpm: 0").unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.field_path.as_deref(), Some("rate_limit_rpm"));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let cfg = RuntimeConfig::default();
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(2));
    }

    #[test]
    fn test_yaml_roundtrip_through_to_yaml() {
        let cfg = RuntimeConfig {
            batch_size: Some(40),
            ..RuntimeConfig::default()
        };
        let text = cfg.to_yaml().unwrap();
        assert_eq!(RuntimeConfig::from_yaml_str(&text).unwrap(), cfg);
    }
}
