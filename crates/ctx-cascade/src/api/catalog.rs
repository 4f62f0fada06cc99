//! Model catalog and pricing used to pick a summarization model.
//!
//! Summaries are a compression job, not a reasoning job, so Tier 3 prefers the
//! cheapest model the active provider offers. The catalog is plain data; the
//! selection itself lives in
//! [`select_summary_model`](crate::context::summarizer::select_summary_model).

use serde::{Deserialize, Serialize};

/// Per-model pricing (USD per 1M tokens).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    /// Price per 1M input tokens.
    pub input_per_million: f64,
    /// Price per 1M output tokens.
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Estimate cost for given token counts.
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }

    /// Cost of a typical summarization call: a long span in, a short
    /// summary out.
    pub fn summary_cost(&self) -> f64 {
        self.estimate_cost(50_000, 2_000)
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        // Mid-range estimate for unknown models.
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

/// Approximate pricing for a model by name.
///
/// Matches on the model name segment (after the last `/` in paths like
/// `"anthropic/claude-sonnet-4"`) to avoid false positives from org
/// prefixes like `"my-org/custom-sonnet-finetune"`.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    let price = |input_per_million, output_per_million| ModelPricing {
        input_per_million,
        output_per_million,
    };

    if name.contains("opus") {
        price(15.0, 75.0)
    } else if name.contains("sonnet") {
        price(3.0, 15.0)
    } else if name.contains("haiku") {
        price(0.25, 1.25)
    } else if name.contains("4o-mini") {
        price(0.15, 0.60)
    } else if name.contains("gpt-4o") || name.contains("gpt-4") {
        price(2.50, 10.0)
    } else if name.starts_with("o1") || name.starts_with("o3") {
        price(15.0, 60.0)
    } else if name.contains("gemini") && name.contains("flash") {
        price(0.075, 0.30)
    } else if name.contains("gemini") {
        price(1.25, 5.0)
    } else if name.contains("deepseek") {
        price(0.27, 1.10)
    } else {
        ModelPricing::default()
    }
}

/// Provider segment of a model id (`"anthropic"` for
/// `"anthropic/claude-sonnet-4"`). Bare ids have no provider.
pub fn provider_of(model: &str) -> Option<&str> {
    model
        .split_once('/')
        .map(|(provider, _)| provider)
        .filter(|p| !p.is_empty())
}

/// One model the provider can serve.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub pricing: ModelPricing,
}

impl ModelInfo {
    /// A model priced from [`pricing_for_model`].
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let pricing = pricing_for_model(&id);
        Self { id, pricing }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn provider(&self) -> Option<&str> {
        provider_of(&self.id)
    }
}

/// Models registered per provider, with pricing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small catalog of well-known OpenRouter models.
    pub fn builtin() -> Self {
        [
            "anthropic/claude-opus-4",
            "anthropic/claude-sonnet-4",
            "anthropic/claude-3.5-haiku",
            "openai/gpt-4o",
            "openai/gpt-4o-mini",
            "google/gemini-2.5-pro",
            "google/gemini-2.5-flash",
            "deepseek/deepseek-chat",
        ]
        .into_iter()
        .fold(Self::new(), |catalog, id| catalog.with_model(ModelInfo::new(id)))
    }

    /// Register a model, replacing any entry with the same id.
    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.models.retain(|m| m.id != model.id);
        self.models.push(model);
        self
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Models registered for `provider`.
    pub fn models_for<'a, 'p>(
        &'a self,
        provider: &'p str,
    ) -> impl Iterator<Item = &'a ModelInfo> + use<'a, 'p> {
        self.models
            .iter()
            .filter(move |m| m.provider() == Some(provider))
    }

    /// Cheapest model registered for `provider`, by typical summarization
    /// cost. Ties keep registration order.
    pub fn cheapest_for(&self, provider: &str) -> Option<&ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.provider() == Some(provider))
            .fold(None, |best: Option<&ModelInfo>, m| match best {
                Some(b) if b.pricing.summary_cost() <= m.pricing.summary_cost() => Some(b),
                _ => Some(m),
            })
    }
}
