//! Compaction configuration.
//!
//! One immutable [`CompactionConfig`] per session. Every field has a default,
//! so a config file only needs the keys it changes:
//!
//! ```
//! use ctx_cascade::config::CompactionConfig;
//!
//! let config = CompactionConfig::from_json_str(r#"{"protected_messages": 6}"#).unwrap();
//! assert_eq!(config.protected_messages, 6);
//! assert_eq!(config.trigger_threshold, 0.80);
//! ```
//!
//! Builder methods cover the common settings, and [`CompactionConfig::set`]
//! applies `key=value` overrides from a command line.

use crate::api::retry::RetryConfig;
use crate::context::budget::{DEFAULT_CHARS_PER_TOKEN, DEFAULT_CONTEXT_WINDOW, TokenAccountant};
use crate::context::failures::DEFAULT_FAILURE_CAPACITY;
use crate::context::summarizer::{DEFAULT_MAX_SUMMARY_TOKENS, SummarizerConfig};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-session compaction settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CompactionConfig {
    /// Occupancy fraction at or above which a cycle starts compacting.
    pub trigger_threshold: f64,
    /// Occupancy fraction a cycle tries to get back to.
    pub target_threshold: f64,
    /// Most recent messages no tier may touch.
    pub protected_messages: usize,
    /// Tier 1 cutoff for a single tool output.
    pub max_tool_output_tokens: usize,
    /// Model context window.
    pub context_window_tokens: usize,
    /// Tokens kept free for the model's reply.
    pub output_reserve_tokens: usize,
    /// Characters per token for the default estimator.
    pub chars_per_token: f64,
    /// Explicit summarization model.
    pub summary_model: Option<String>,
    pub max_summary_tokens: u32,
    /// Retries for transient summarization failures.
    pub summary_retries: u32,
    /// Failure records kept by the tracker.
    pub failure_capacity: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 0.80,
            target_threshold: 0.60,
            protected_messages: 10,
            max_tool_output_tokens: 2000,
            context_window_tokens: DEFAULT_CONTEXT_WINDOW,
            output_reserve_tokens: 0,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            summary_model: None,
            max_summary_tokens: DEFAULT_MAX_SUMMARY_TOKENS,
            summary_retries: 2,
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
        }
    }
}

impl CompactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn with_thresholds(mut self, trigger: f64, target: f64) -> Self {
        self.trigger_threshold = trigger;
        self.target_threshold = target;
        self
    }

    pub fn with_protected_messages(mut self, n: usize) -> Self {
        self.protected_messages = n;
        self
    }

    pub fn with_max_tool_output_tokens(mut self, tokens: usize) -> Self {
        self.max_tool_output_tokens = tokens;
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.output_reserve_tokens = tokens;
        self
    }

    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        self.chars_per_token = ratio;
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_summary_retries(mut self, retries: u32) -> Self {
        self.summary_retries = retries;
        self
    }

    pub fn with_failure_capacity(mut self, capacity: usize) -> Self {
        self.failure_capacity = capacity;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (trigger, target) = (self.trigger_threshold, self.target_threshold);
        if !(target > 0.0 && target < trigger && trigger <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 < target < trigger <= 1 (target {target}, trigger {trigger})"
            )));
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            return Err(invalid("chars_per_token", self.chars_per_token));
        }
        if self.max_tool_output_tokens == 0 {
            return Err(invalid("max_tool_output_tokens", 0));
        }
        if self.failure_capacity == 0 {
            return Err(invalid("failure_capacity", 0));
        }
        if self.max_summary_tokens == 0 {
            return Err(invalid("max_summary_tokens", 0));
        }
        if self.context_window_tokens == 0 {
            return Err(invalid("context_window_tokens", 0));
        }
        if self.output_reserve_tokens >= self.context_window_tokens {
            return Err(ConfigError::Invalid(format!(
                "output_reserve_tokens ({}) leaves no room in a {}-token window",
                self.output_reserve_tokens, self.context_window_tokens
            )));
        }
        Ok(())
    }

    /// Apply one `key=value` override. Does not re-validate; call
    /// [`validate`](Self::validate) after the last override.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key.trim() {
            "trigger_threshold" => self.trigger_threshold = parse(key, value)?,
            "target_threshold" => self.target_threshold = parse(key, value)?,
            "protected_messages" => self.protected_messages = parse(key, value)?,
            "max_tool_output_tokens" => self.max_tool_output_tokens = parse(key, value)?,
            "context_window_tokens" => self.context_window_tokens = parse(key, value)?,
            "output_reserve_tokens" => self.output_reserve_tokens = parse(key, value)?,
            "chars_per_token" => self.chars_per_token = parse(key, value)?,
            "summary_model" => {
                self.summary_model = match value {
                    "" | "none" => None,
                    model => Some(model.to_string()),
                }
            }
            "max_summary_tokens" => self.max_summary_tokens = parse(key, value)?,
            "summary_retries" => self.summary_retries = parse(key, value)?,
            "failure_capacity" => self.failure_capacity = parse(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Apply a `key=value` string.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("expected key=value, got {assignment:?}")))?;
        self.set(key, value)
    }

    /// Token accountant sized for this config.
    pub fn accountant(&self) -> TokenAccountant {
        TokenAccountant::with_calibration(Some(self.chars_per_token))
            .with_context_window(self.context_window_tokens)
            .with_output_reserve(self.output_reserve_tokens)
    }

    /// Tier 3 settings.
    pub fn summarizer_config(&self) -> SummarizerConfig {
        SummarizerConfig {
            model: self.summary_model.clone(),
            max_summary_tokens: self.max_summary_tokens,
            retry: RetryConfig::with_retries(self.summary_retries),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
