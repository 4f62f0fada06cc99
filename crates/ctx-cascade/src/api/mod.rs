//! Provider layer: the model seam used by summarization, plus the bundled
//! OpenRouter client, retry policy and model catalog.
//!
//! - [`ModelProvider`]: one async `complete(prompt, model)` call. Tier 3 is
//!   the only caller.
//! - [`openrouter`]: reqwest client for OpenRouter chat completions.
//! - [`retry`]: transient error detection with exponential backoff and
//!   jitter. Never retries 400/401 errors.
//! - [`catalog`]: models per provider with pricing, for picking the cheapest
//!   summarization model.

pub mod catalog;
pub mod openrouter;
pub mod retry;

pub use catalog::{ModelCatalog, ModelInfo, ModelPricing, pricing_for_model};
pub use openrouter::OpenRouterClient;
pub use retry::RetryConfig;

use crate::error::ProviderError;
use futures::future::BoxFuture;

/// A one-shot completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPrompt {
    pub system: String,
    pub user: String,
    /// Cap on the response length.
    pub max_tokens: u32,
}

/// A model provider that can answer a single prompt.
///
/// Implementations must be cancel safe: dropping the returned future
/// abandons the request without side effects on the caller.
pub trait ModelProvider: Send + Sync {
    fn complete<'a>(
        &'a self,
        prompt: &'a CompletionPrompt,
        model: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>>;
}

impl<P: ModelProvider + ?Sized> ModelProvider for std::sync::Arc<P> {
    fn complete<'a>(
        &'a self,
        prompt: &'a CompletionPrompt,
        model: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>> {
        (**self).complete(prompt, model)
    }
}

/// Provider that fails every request. Used when running without network
/// access; Tier 3 then reports a summarization failure and the cycle keeps
/// whatever Tier 1/2 achieved.
#[derive(Debug, Clone, Default)]
pub struct OfflineProvider;

impl ModelProvider for OfflineProvider {
    fn complete<'a>(
        &'a self,
        _prompt: &'a CompletionPrompt,
        model: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>> {
        let err = ProviderError::MissingCredentials(format!("offline: no provider for {model}"));
        Box::pin(async move { Err(err) })
    }
}
