//! Token accounting: estimates how much of the context window the log
//! occupies.
//!
//! Estimates always round up. An estimate that is too high only makes the
//! cascade compact a little early; an estimate that is too low lets a request
//! exceed the provider limit, which is fatal to the turn. The same reasoning
//! applies to failures: when a [`TokenCounter`] cannot count a piece of text,
//! the accountant assumes one token per byte.

use crate::conversation::Conversation;
use crate::error::TokenEstimationError;
use crate::{BlockKind, ContentBlock, Message};
use std::sync::Arc;
use tracing::debug;

/// Token counts are plain `usize` values.
pub type TokenCount = usize;

/// Default characters per token (conservative estimate for English text and
/// code). Most tokenizers average 3-4 chars per token.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Ratio used when the configured one is unusable: every byte is a token.
pub const WORST_CASE_CHARS_PER_TOKEN: f64 = 1.0;

/// Default context window size in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Role marker, separators and framing per message.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Block framing (type tag, ids, JSON punctuation).
const BLOCK_OVERHEAD_TOKENS: usize = 3;

/// Counts the tokens in a piece of text.
///
/// Implement this to plug in a real tokenizer. Implementations must be
/// monotonic: appending text never lowers the count.
pub trait TokenCounter: Send + Sync + std::fmt::Debug {
    fn count(&self, text: &str) -> Result<TokenCount, TokenEstimationError>;

    /// Identifies the counter's configuration. Cached block estimates are
    /// reused only when the fingerprint matches.
    fn fingerprint(&self) -> u64;
}

/// Characters-per-token heuristic. Never fails.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioCounter {
    chars_per_token: f64,
}

impl CharRatioCounter {
    /// A non-finite or non-positive ratio is replaced with
    /// [`WORST_CASE_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            debug!("unusable chars-per-token ratio {chars_per_token}; assuming worst case");
            WORST_CASE_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter for CharRatioCounter {
    fn count(&self, text: &str) -> Result<TokenCount, TokenEstimationError> {
        Ok((text.len() as f64 / self.chars_per_token).ceil() as usize)
    }

    fn fingerprint(&self) -> u64 {
        self.chars_per_token.to_bits()
    }
}

/// Estimates token usage of messages and whole logs.
///
/// # Example
///
/// ```
/// use ctx_cascade::context::budget::TokenAccountant;
/// use ctx_cascade::conversation::Conversation;
/// use ctx_cascade::Message;
///
/// let accountant = TokenAccountant::with_calibration(None)
///     .with_context_window(128_000)
///     .with_output_reserve(4096);
///
/// let log = Conversation::from_messages([Message::user("Fix the build.", 0)]);
/// let occupancy = accountant.occupancy(&log);
/// assert!(occupancy.fraction < 0.01);
/// ```
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    counter: Arc<dyn TokenCounter>,
    /// Maximum context window in tokens.
    context_window: usize,
    /// Tokens reserved for model output.
    output_reserve: usize,
    /// Tokens reserved for the system prompt and tool definitions.
    system_reserve: usize,
}

impl TokenAccountant {
    /// Create an accountant using the chars-per-token heuristic. Pass a
    /// calibrated ratio from observed provider usage, or `None` for the
    /// default.
    pub fn with_calibration(calibrated_cpt: Option<f64>) -> Self {
        Self::with_counter(CharRatioCounter::new(
            calibrated_cpt.unwrap_or(DEFAULT_CHARS_PER_TOKEN),
        ))
    }

    /// Create an accountant backed by a custom counter.
    pub fn with_counter(counter: impl TokenCounter + 'static) -> Self {
        Self {
            counter: Arc::new(counter),
            context_window: DEFAULT_CONTEXT_WINDOW,
            output_reserve: 0,
            system_reserve: 0,
        }
    }

    /// Override the context window size (in tokens).
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Set tokens reserved for model output.
    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.output_reserve = tokens;
        self
    }

    /// Set tokens reserved for the system prompt.
    pub fn with_system_reserve(mut self, tokens: usize) -> Self {
        self.system_reserve = tokens;
        self
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Context window minus output and system reserves. All occupancy
    /// fractions are computed against this.
    pub fn effective_window(&self) -> usize {
        self.context_window
            .saturating_sub(self.output_reserve)
            .saturating_sub(self.system_reserve)
    }

    /// Token count for raw text. Counter failures fall back to one token per
    /// byte.
    pub fn estimate_text(&self, text: &str) -> TokenCount {
        match self.counter.count(text) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!("{e}; assuming {} tokens", text.len());
                text.len()
            }
        }
    }

    /// Token count for one block, cached on the block.
    pub fn estimate_block(&self, block: &ContentBlock) -> TokenCount {
        block.cached_tokens(self.counter.fingerprint(), || {
            let body = match block.kind() {
                BlockKind::Text { text } | BlockKind::Thinking { text } => self.estimate_text(text),
                BlockKind::ToolCall {
                    name, arguments, ..
                } => self.estimate_text(name) + self.estimate_text(arguments),
                BlockKind::ToolResult {
                    tool_name, content, ..
                } => self.estimate_text(tool_name) + self.estimate_text(content),
            };
            body + BLOCK_OVERHEAD_TOKENS
        })
    }

    /// Token count for one message.
    pub fn estimate(&self, message: &Message) -> TokenCount {
        MESSAGE_OVERHEAD_TOKENS
            + message
                .blocks
                .iter()
                .map(|b| self.estimate_block(b))
                .sum::<usize>()
    }

    /// Token count for a slice of messages.
    pub fn estimate_messages(&self, messages: &[Message]) -> TokenCount {
        messages.iter().map(|m| self.estimate(m)).sum()
    }

    /// Token count for the whole log.
    pub fn estimate_total(&self, log: &Conversation) -> TokenCount {
        self.estimate_messages(log.messages())
    }

    /// Token count that corresponds to `fraction` of the effective window,
    /// rounded down so targets are never overshot.
    pub fn tokens_at(&self, fraction: f64) -> TokenCount {
        (self.effective_window() as f64 * fraction).floor() as usize
    }

    /// Approximate number of bytes that fit in `tokens`. Used to size
    /// head/tail cuts before they are re-measured.
    pub fn bytes_for_tokens(&self, tokens: TokenCount) -> usize {
        // Measure the counter on a fixed sample to learn its ratio.
        const SAMPLE: &str = "the quick brown fox jumps over the lazy dog; fn main() {}\n";
        let sample_tokens = self.estimate_text(SAMPLE).max(1);
        let ratio = SAMPLE.len() as f64 / sample_tokens as f64;
        (tokens as f64 * ratio).floor() as usize
    }

    /// Snapshot of how full the context window is.
    pub fn occupancy(&self, log: &Conversation) -> Occupancy {
        self.occupancy_of(self.estimate_total(log))
    }

    /// Occupancy for an already computed token total.
    pub fn occupancy_of(&self, estimated_tokens: TokenCount) -> Occupancy {
        let window = self.effective_window();
        let fraction = if window > 0 {
            estimated_tokens as f64 / window as f64
        } else {
            1.0
        };
        Occupancy {
            estimated_tokens,
            window_tokens: window,
            fraction,
        }
    }
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::with_calibration(None)
    }
}

/// Snapshot of context occupancy at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupancy {
    /// Estimated tokens in the log.
    pub estimated_tokens: TokenCount,
    /// Effective window the fraction is measured against.
    pub window_tokens: TokenCount,
    /// Occupancy as a fraction (0.0 to 1.0+).
    pub fraction: f64,
}

impl Occupancy {
    /// At or above `threshold`. Ties trigger.
    pub fn at_or_above(&self, threshold: f64) -> bool {
        self.fraction >= threshold
    }

    /// At or below `threshold`. Ties satisfy.
    pub fn within(&self, threshold: f64) -> bool {
        self.fraction <= threshold
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.fraction * 100.0,
            self.window_tokens,
        )
    }
}
