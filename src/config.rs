//! # Configuration
//! [EngineConfig] gathers every knob of the engine. All fields have defaults, so a config can be written partially:
//!
//! ```
//! use slotgen::config::EngineConfig;
//! let config = EngineConfig::from_json_str(r#"{"model": "gpt-4", "retry": {"attempts": 3}}"#).unwrap();
//! assert_eq!(3, config.retry.attempts);
//! assert_eq!(2000, config.retry.base_backoff_ms);
//! assert_eq!(Some(8192), config.context_window());
//! ```

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::bias::DEFAULT_RANGE_BIAS_LIMIT;
use crate::utils::token::tiktoken::context_window_of;

/// Retry policy of transient endpoint failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub attempts: u32,
    /// Delay before the first retry. Doubles with every retry.
    pub base_backoff_ms: u64,
    /// Ceiling of the delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            base_backoff_ms: 2000,
            max_backoff_ms: 30000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model id sent with every request.
    pub model: String,
    /// Temperature of slots that do not set one.
    pub temperature: Option<f32>,
    /// Max output tokens of slots that do not set one.
    pub max_tokens: Option<u32>,
    /// Context window of the model. Looked up by model id if unset.
    pub context_window: Option<usize>,
    pub retry: RetryConfig,
    /// Time a streaming call may take to deliver its first delta.
    pub first_byte_timeout_ms: u64,
    /// Widest range, as `to - from`, that gets a logit bias.
    pub range_bias_limit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo-instruct".to_string(),
            temperature: None,
            max_tokens: None,
            context_window: None,
            retry: RetryConfig::default(),
            first_byte_timeout_ms: 10_000,
            range_bias_limit: DEFAULT_RANGE_BIAS_LIMIT,
        }
    }
}

impl EngineConfig {
    /// A default config for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }

    /// The configured context window, or the known one of the model.
    pub fn context_window(&self) -> Option<usize> {
        self.context_window.or_else(|| context_window_of(&self.model))
    }
}
