//! Orchestration policy and reasoning-service settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    Zero(&'static str),

    #[error("{0} not set in environment")]
    MissingEnv(&'static str),
}

/// Numeric policy of the orchestrator.
///
/// Every wait point is bounded by one of these values. Retries are fixed
/// counts, never exponential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Policy {
    /// Base polling tick of the override window.
    pub tick_ms: u64,

    /// Override window length, in ticks.
    pub window_ticks: u32,

    /// Snapshot captures attempted before giving up on a page.
    pub snapshot_attempts: u32,

    /// Pause between snapshot attempts.
    pub snapshot_retry_ms: u64,

    /// Reasoning-service attempts per query.
    pub provider_attempts: u32,

    /// How many `fail` answers are re-queried before the run errors.
    pub fail_retries: u32,

    /// Hard cap on recorded steps.
    pub max_steps: usize,

    /// Re-attach attempts when the remote channel drops mid-run.
    pub reattach_attempts: u32,

    /// User log entries per reconciliation request.
    pub reconcile_chunk_size: usize,

    pub keystroke_delay_ms: u64,
    pub click_settle_ms: u64,

    /// Only report elements inside the current viewport.
    pub viewport_only: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            window_ticks: 80,
            snapshot_attempts: 10,
            snapshot_retry_ms: 5,
            provider_attempts: 3,
            fail_retries: 3,
            max_steps: 50,
            reattach_attempts: 3,
            reconcile_chunk_size: 4,
            keystroke_delay_ms: 10,
            click_settle_ms: 5,
            viewport_only: true,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::Zero("tick_ms"));
        }
        if self.window_ticks == 0 {
            return Err(ConfigError::Zero("window_ticks"));
        }
        if self.snapshot_attempts == 0 {
            return Err(ConfigError::Zero("snapshot_attempts"));
        }
        if self.provider_attempts == 0 {
            return Err(ConfigError::Zero("provider_attempts"));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Zero("max_steps"));
        }
        if self.reconcile_chunk_size == 0 {
            return Err(ConfigError::Zero("reconcile_chunk_size"));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Connection settings for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: 500,
        }
    }

    /// Reads `OPENAI_API_KEY`, and optionally `OPENAI_BASE_URL` and `WEBPILOT_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| ConfigError::MissingEnv("OPENAI_API_KEY"))?;
        let mut settings = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            settings.base_url = base_url;
        }
        if let Ok(model) = std::env::var("WEBPILOT_MODEL") {
            settings.model = model;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = Policy::default();
        assert_eq!(policy.validate(), Ok(()));
        assert_eq!(policy.tick() * policy.window_ticks, Duration::from_secs(8));
    }

    #[test]
    fn zero_tick_is_rejected() {
        let policy = Policy {
            tick_ms: 0,
            ..Policy::default()
        };
        assert_eq!(policy.validate(), Err(ConfigError::Zero("tick_ms")));
    }

    #[test]
    fn policy_fills_missing_fields_from_defaults() {
        let policy: Policy = serde_json::from_str(r#"{"max_steps": 5}"#).unwrap();
        assert_eq!(policy.max_steps, 5);
        assert_eq!(policy.provider_attempts, 3);
    }
}
