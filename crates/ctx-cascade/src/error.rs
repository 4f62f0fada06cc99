//! Error types for the compaction core.
//!
//! Nothing in this crate is allowed to take a session down. Every error here
//! is recovered by the caller that receives it: token estimation falls back to
//! a worst-case count, a failed summarization leaves the log untouched and is
//! retried on the next cycle, and configuration errors surface before a
//! session starts.

use thiserror::Error;

/// A [`TokenCounter`](crate::context::budget::TokenCounter) could not
/// produce a count. The accountant treats the text as one token per byte.
#[derive(Debug, Error)]
#[error("token estimation failed: {0}")]
pub struct TokenEstimationError(pub String);

/// Failure reported by a [`ModelProvider`](crate::api::ModelProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Network(String),

    #[error("provider API error: {0}")]
    Api(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    ///
    /// Rate limits, 5xx responses and network failures are transient.
    /// Everything else (bad request, auth, undecodable bodies) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            ProviderError::Network(_) => true,
            ProviderError::Api(msg) => crate::api::retry::is_transient_error(msg),
            ProviderError::Decode(_) | ProviderError::MissingCredentials(_) => false,
        }
    }
}

/// Tier 3 could not replace the span with a summary.
///
/// Always non-fatal: the orchestrator keeps the Tier 1/2 results and tries
/// again on the next cycle.
#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("no summarizable span outside the protected window")]
    EmptySpan,

    #[error("summarization call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("malformed summary response: {0}")]
    MalformedResponse(String),

    #[error("summary ({summary_tokens} tokens) does not shrink the span ({span_tokens} tokens)")]
    NoReduction {
        span_tokens: usize,
        summary_tokens: usize,
    },
}

/// Invalid or unreadable [`CompactionConfig`](crate::config::CompactionConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown config key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors() {
        assert!(
            ProviderError::Http {
                status: 429,
                body: "slow down".into()
            }
            .is_transient()
        );
        assert!(ProviderError::Network("connection reset".into()).is_transient());
        assert!(
            !ProviderError::Http {
                status: 401,
                body: "unauthorized".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn provider_error_converts_into_summarization_error() {
        let err: SummarizationError = ProviderError::Network("timed out".into()).into();
        assert!(matches!(err, SummarizationError::Provider(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
