//! OpenRouter chat completions client.
//!
//! The only provider bundled with the crate. Summarization needs a single
//! non-streaming completion, so the request carries a system message, a user
//! message and a token cap, and the response is reduced to its text.

use super::{CompletionPrompt, ModelProvider};
use crate::error::ProviderError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

/// Sampling temperature for summaries: low, so reruns stay close.
const SUMMARY_TEMPERATURE: f32 = 0.2;

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Chat completion request body.
#[derive(Serialize, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn from_prompt(prompt: &CompletionPrompt, model: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.user.clone(),
                },
            ],
            max_tokens: prompt.max_tokens,
            temperature: SUMMARY_TEMPERATURE,
        }
    }
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    usage: Option<UsageInfo>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_headers(
            api_key,
            "https://github.com/tacryt-socryp/ctx-cascade",
            "ctx-cascade",
        )
    }

    /// Read the key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| ProviderError::MissingCredentials(format!("{API_KEY_ENV} not set")))?;
        Self::new(key)
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("ctx-cascade/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Send a chat completion request and return the reply text.
    pub async fn chat(&self, body: &ChatRequest) -> Result<String, ProviderError> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("failed to read response: {e}")))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_response(&text)
    }
}

/// Extract the reply text from a raw response body.
fn parse_response(text: &str) -> Result<String, ProviderError> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if let Some(err) = parsed.error {
        return Err(ProviderError::Api(err.message));
    }

    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0),
        );
    }

    let choice = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ProviderError::Decode("response has no choices".into()))?;
    if let Some(reason) = &choice.finish_reason {
        trace!("finish_reason={reason}");
    }
    // Empty content is passed through; the summarizer decides what is malformed.
    Ok(choice.message.content.unwrap_or_default())
}

impl ModelProvider for OpenRouterClient {
    fn complete<'a>(
        &'a self,
        prompt: &'a CompletionPrompt,
        model: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>> {
        Box::pin(async move { self.chat(&ChatRequest::from_prompt(prompt, model)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_system_and_user() {
        let prompt = CompletionPrompt {
            system: "sys".into(),
            user: "span".into(),
            max_tokens: 512,
        };
        let req = ChatRequest::from_prompt(&prompt, "anthropic/claude-3.5-haiku");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "anthropic/claude-3.5-haiku");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "span");
        assert_eq!(json["max_tokens"], 512);
    }

    #[test]
    fn parses_reply_text() {
        let body = r#"{"choices":[{"message":{"content":"summary"},"finish_reason":"stop"}],
                       "usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#;
        assert_eq!(parse_response(body).unwrap(), "summary");
    }

    #[test]
    fn api_error_in_body() {
        let body = r#"{"error":{"message":"Provider overloaded"}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, ProviderError::Api(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_choices_is_decode_error() {
        assert!(matches!(
            parse_response(r#"{"choices":[]}"#),
            Err(ProviderError::Decode(_))
        ));
        assert!(matches!(
            parse_response("not json"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn debug_hides_key() {
        let client = OpenRouterClient::new("sk-secret").unwrap();
        assert!(!format!("{client:?}").contains("sk-secret"));
    }
}
